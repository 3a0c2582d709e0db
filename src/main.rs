//! Tonestream - 合成音频流式播放演示
//!
//! 设计目标：
//! - 回调零分配、零锁：lock-free SPSC 通道 + 静音兜底
//! - 生产者按背压写入，结束前排空缓冲区，不截断尾音

use std::io::{self, Write};
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};

use tonestream::alloc::{self, RealtimeAuditAllocator};
use tonestream::audio::{ClockedDevice, DeviceBinding};
use tonestream::engine::{Engine, EngineConfig};
use tonestream::source::{NoteSequence, SampleSource, ToneSource, Waveform, SPACE_ODYSSEY};

#[global_allocator]
static ALLOC: RealtimeAuditAllocator = RealtimeAuditAllocator;

/// Tonestream - stream synthesized audio to an output device
#[derive(Parser)]
#[command(name = "tonestream")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output gain (0.0 = mute, 1.0 = full scale)
    #[arg(short, long, default_value = "0.1", global = true)]
    gain: f32,

    /// Nominal sample rate in Hz
    #[arg(long, default_value = "44100", global = true)]
    sample_rate: u32,

    /// Frames per device callback
    #[arg(long, default_value = "256", global = true)]
    frames: u32,

    /// Ring buffer size per channel in milliseconds
    #[arg(short, long, default_value = "3000", global = true)]
    buffer_ms: u64,

    /// Waveform used for synthesis
    #[arg(short, long, value_enum, default_value = "square", global = true)]
    waveform: WaveformArg,

    /// Output device: 'clocked' (software clock, no sound), 'default', or a device name
    #[arg(short, long, default_value = "clocked", global = true)]
    device: String,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Play the opening of "Also sprach Zarathustra"
    Melody {
        /// Multiply every note frequency (0.5 = one octave down)
        #[arg(long, default_value = "0.5")]
        pitch_scale: f32,
    },

    /// Play a single tone, live until Ctrl+C unless --ms is given
    Tone {
        /// Frequency in Hz
        #[arg(long)]
        freq: f32,

        /// Duration in milliseconds
        #[arg(long)]
        ms: Option<i64>,
    },

    /// List output devices
    Devices,
}

#[derive(Clone, Copy, ValueEnum)]
enum WaveformArg {
    Square,
    Sine,
}

impl From<WaveformArg> for Waveform {
    fn from(arg: WaveformArg) -> Self {
        match arg {
            WaveformArg::Square => Waveform::Square,
            WaveformArg::Sine => Waveform::Sine,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    match cli.command {
        Commands::Devices => list_devices(),
        Commands::Melody { pitch_scale } => {
            let source = NoteSequence::new(SPACE_ODYSSEY, cli.sample_rate)
                .with_waveform(cli.waveform.into())
                .with_pitch_scale(pitch_scale);
            println!(
                "Tonestream - Melody ({:.1}s, pitch x{})",
                source.total_frames() as f64 / cli.sample_rate as f64,
                pitch_scale
            );
            play(&cli, source)
        }
        Commands::Tone { freq, ms } => {
            let mut source = ToneSource::new(cli.waveform.into(), freq, cli.sample_rate);
            match ms {
                Some(ms) => {
                    source = source.with_duration_ms(ms, cli.sample_rate);
                    println!("Tonestream - Tone {:.2}Hz for {}ms", freq, ms);
                }
                None => println!("Tonestream - Tone {:.2}Hz", freq),
            }
            play(&cli, source)
        }
    }
}

/// 列出输出设备
fn list_devices() -> anyhow::Result<()> {
    println!("=== Audio Output Devices ===\n");
    println!("  clocked (software clock, discards output)");

    #[cfg(feature = "cpal")]
    {
        let names = tonestream::audio::device::list_output_devices()?;
        for name in &names {
            println!("  {}", name);
        }
        println!();
        println!("Select device: tonestream -d <NAME> melody");
    }

    #[cfg(not(feature = "cpal"))]
    println!("\nBuilt without the 'cpal' feature: hardware devices unavailable.");

    Ok(())
}

/// 按名字选择设备绑定
fn open_binding(name: &str) -> anyhow::Result<Box<dyn DeviceBinding>> {
    if name == "clocked" {
        return Ok(Box::new(ClockedDevice::new()));
    }

    #[cfg(feature = "cpal")]
    {
        use tonestream::audio::device::CpalDevice;
        if name == "default" {
            return Ok(Box::new(CpalDevice::default_output()));
        }
        Ok(Box::new(CpalDevice::by_name(name)))
    }

    #[cfg(not(feature = "cpal"))]
    {
        bail!(
            "device '{}' requires the 'cpal' feature (rebuild with --features cpal)",
            name
        )
    }
}

/// 创建引擎配置
fn create_engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        sample_rate: cli.sample_rate,
        frames_per_callback: cli.frames,
        gain: cli.gain,
        ..EngineConfig::default()
    }
    .with_buffer_ms(cli.buffer_ms)
}

/// 播放数据源直到结束或 Ctrl+C
fn play<S: SampleSource + 'static>(cli: &Cli, source: S) -> anyhow::Result<()> {
    if !cli.gain.is_finite() || cli.gain < 0.0 {
        bail!("gain must be a non-negative number, got {}", cli.gain);
    }

    let mut binding = open_binding(&cli.device)?;
    let mut engine =
        Engine::new(create_engine_config(cli)).context("invalid engine configuration")?;

    // Ctrl+C 直接设置引擎的停止标志，生产者会排空后退出
    let stop = engine.stop_handle();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    })?;

    print!("Buffering...");
    io::stdout().flush()?;

    engine
        .play(binding.as_mut(), source)
        .with_context(|| format!("failed to start playback on '{}'", cli.device))?;

    let format = engine.format();
    println!(
        "\rPlaying at {}Hz, {} frames/callback. Press Ctrl+C to stop.\n",
        format.sample_rate, format.frames_per_callback
    );

    // 生产者线程异常退出时 is_finished 不会置位
    while !engine.is_finished() && engine.is_producer_running() {
        engine.log_diagnostics();

        let stats = engine.stats();
        let pos_mins = (stats.position_secs / 60.0) as u32;
        let pos_secs = stats.position_secs % 60.0;

        print!(
            "\r  {:02}:{:05.2}  |  Buffer: {:5.1}%  |  Underruns: {}  ",
            pos_mins,
            pos_secs,
            stats.buffer_fill_ratio * 100.0,
            stats.underrun_count
        );
        io::stdout().flush()?;

        std::thread::sleep(Duration::from_millis(100));
    }

    println!();
    let report = engine.wait()?;
    println!(
        "Done: {} frames written, {} deferrals ({:?})\n",
        report.frames_written, report.deferrals, report.outcome
    );
    if cli.verbose {
        print!("{}", engine.playback_report());
    }
    if !report.drained {
        eprintln!("Warning: output stopped consuming before the buffer drained");
    }

    let realtime_allocs = alloc::realtime_allocations();
    if realtime_allocs > 0 {
        log::warn!(
            "{} heap allocation(s) happened on the realtime thread",
            realtime_allocs
        );
    }

    Ok(())
}
