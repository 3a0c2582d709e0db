//! 设备绑定
//!
//! 物理设备、驱动和流的打开/启动/停止/关闭都在核心之外。
//! 核心只依赖这里的调用契约：设备以固定节奏调用 [`RealtimeSink::render`]，
//! 每次恰好 `frames_per_callback` 帧，且同一时刻最多只有一个回调在执行。

mod clocked;
#[cfg(feature = "cpal")]
mod cpal;

pub use clocked::{ClockedDevice, ClockedStream, CaptureTap};
#[cfg(feature = "cpal")]
pub use self::cpal::{list_output_devices, CpalDevice};

use super::format::StreamFormat;
use super::sink::RealtimeSink;

/// 设备错误
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No audio output device available")]
    NoDevice,
    #[error("Unsupported stream format: {0}")]
    UnsupportedFormat(String),
    #[error("Failed to open stream: {0}")]
    Open(String),
    #[error("Failed to start stream: {0}")]
    Start(String),
    #[error("Failed to stop stream: {0}")]
    Stop(String),
    #[error("Failed to close stream: {0}")]
    Close(String),
}

/// 打开设备流
///
/// `sink` 即回调，其中持有的 `StreamState` 即 user data。
pub trait DeviceBinding {
    fn open(
        &mut self,
        format: &StreamFormat,
        sink: RealtimeSink,
    ) -> Result<Box<dyn DeviceStream>, DeviceError>;
}

/// 已打开的设备流
pub trait DeviceStream {
    /// 开始调用回调
    fn start(&mut self) -> Result<(), DeviceError>;

    /// 停止调用回调；返回后不会再有回调执行
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// 设备流当前是否在运行
    fn is_active(&self) -> bool;

    /// 释放设备流。即使返回错误，资源也已释放。
    fn close(self: Box<Self>) -> Result<(), DeviceError>;
}
