//! cpal 设备绑定
//!
//! 以固定的双声道 f32 配置和固定缓冲区大小打开输出设备。

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{DeviceBinding, DeviceError, DeviceStream};
use crate::audio::format::StreamFormat;
use crate::audio::sink::RealtimeSink;

/// 列出所有输出设备的名字
pub fn list_output_devices() -> Result<Vec<String>, DeviceError> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| DeviceError::Open(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// cpal 输出设备
///
/// `device_name` 为 `None` 时使用系统默认输出设备
pub struct CpalDevice {
    device_name: Option<String>,
}

impl CpalDevice {
    pub fn default_output() -> Self {
        Self { device_name: None }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    fn resolve(&self) -> Result<cpal::Device, DeviceError> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host.default_output_device().ok_or(DeviceError::NoDevice),
            Some(name) => host
                .output_devices()
                .map_err(|e| DeviceError::Open(e.to_string()))?
                .find(|d| d.name().ok().as_deref() == Some(name.as_str()))
                .ok_or(DeviceError::NoDevice),
        }
    }
}

impl DeviceBinding for CpalDevice {
    fn open(
        &mut self,
        format: &StreamFormat,
        mut sink: RealtimeSink,
    ) -> Result<Box<dyn DeviceStream>, DeviceError> {
        let device = self.resolve()?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Fixed(format.frames_per_callback),
        };

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    sink.render(data);
                },
                |err| log::error!("Audio stream error: {}", err),
                None,
            )
            .map_err(|e| match e {
                cpal::BuildStreamError::StreamConfigNotSupported => {
                    DeviceError::UnsupportedFormat(format!(
                        "{}ch f32 @ {}Hz, {} frames",
                        format.channels, format.sample_rate, format.frames_per_callback
                    ))
                }
                cpal::BuildStreamError::DeviceNotAvailable => DeviceError::NoDevice,
                other => DeviceError::Open(other.to_string()),
            })?;

        // 部分后端 build 之后立即开始播放，统一为停止状态，由 start() 控制
        if let Err(e) = stream.pause() {
            log::debug!("Initial pause not supported: {}", e);
        }

        log::info!(
            "Opened output device: {} ({}Hz, {} frames/callback)",
            name,
            format.sample_rate,
            format.frames_per_callback
        );

        Ok(Box::new(CpalStream {
            stream: Some(stream),
            active: false,
        }))
    }
}

struct CpalStream {
    stream: Option<cpal::Stream>,
    active: bool,
}

impl DeviceStream for CpalStream {
    fn start(&mut self) -> Result<(), DeviceError> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| DeviceError::Start("stream already closed".to_string()))?;
        stream
            .play()
            .map_err(|e| DeviceError::Start(e.to_string()))?;
        self.active = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(());
        };
        self.active = false;
        stream.pause().map_err(|e| DeviceError::Stop(e.to_string()))
    }

    fn is_active(&self) -> bool {
        self.active && self.stream.is_some()
    }

    fn close(mut self: Box<Self>) -> Result<(), DeviceError> {
        // cpal 在 drop 时关闭流
        self.active = false;
        self.stream = None;
        Ok(())
    }
}
