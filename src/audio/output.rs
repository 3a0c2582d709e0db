//! 输出流
//!
//! 包装一个已打开的设备流，对所有者暴露 start / stop / is_active。
//! 拆除是尽力而为的：stop/close 失败只记录日志，资源总会被释放。

use super::device::{DeviceBinding, DeviceError, DeviceStream};
use super::format::StreamFormat;
use super::sink::RealtimeSink;

/// 音频输出流
pub struct AudioStream {
    stream: Option<Box<dyn DeviceStream>>,
    format: StreamFormat,
}

impl AudioStream {
    /// 通过设备绑定打开流（尚未启动）
    pub fn open<B: DeviceBinding + ?Sized>(
        binding: &mut B,
        format: StreamFormat,
        sink: RealtimeSink,
    ) -> Result<Self, DeviceError> {
        let stream = binding.open(&format, sink)?;
        Ok(Self {
            stream: Some(stream),
            format,
        })
    }

    /// 启动输出
    pub fn start(&mut self) -> Result<(), DeviceError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| DeviceError::Start("stream already closed".to_string()))?;

        if stream.is_active() {
            return Ok(());
        }

        stream.start()?;
        log::info!(
            "Audio output started: {}Hz, {} channels, {} frames/callback",
            self.format.sample_rate,
            self.format.channels,
            self.format.frames_per_callback
        );
        Ok(())
    }

    /// 停止输出
    pub fn stop(&mut self) -> Result<(), DeviceError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        if !stream.is_active() {
            return Ok(());
        }

        stream.stop()?;
        log::info!("Audio output stopped");
        Ok(())
    }

    /// 检查是否正在运行
    pub fn is_active(&self) -> bool {
        self.stream.as_ref().map(|s| s.is_active()).unwrap_or(false)
    }

    /// 停止并释放设备流
    ///
    /// stop 失败不会阻止 close；返回遇到的第一个错误
    pub fn close(&mut self) -> Result<(), DeviceError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };

        let stopped = if stream.is_active() {
            stream.stop()
        } else {
            Ok(())
        };
        if let Err(ref e) = stopped {
            log::warn!("Stopping stream during teardown failed: {}", e);
        }

        let closed = stream.close();
        if let Err(ref e) = closed {
            log::warn!("Closing stream failed: {}", e);
        }

        log::debug!("Audio stream closed");
        stopped.and(closed)
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::state::StreamState;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    #[derive(Default)]
    struct Calls {
        log: Vec<&'static str>,
    }

    /// 可注入失败的测试设备
    struct FlakyDevice {
        calls: Rc<RefCell<Calls>>,
        fail_stop: bool,
        fail_close: bool,
    }

    struct FlakyStream {
        calls: Rc<RefCell<Calls>>,
        active: bool,
        fail_stop: bool,
        fail_close: bool,
    }

    impl DeviceBinding for FlakyDevice {
        fn open(
            &mut self,
            _format: &StreamFormat,
            _sink: RealtimeSink,
        ) -> Result<Box<dyn DeviceStream>, DeviceError> {
            self.calls.borrow_mut().log.push("open");
            Ok(Box::new(FlakyStream {
                calls: Rc::clone(&self.calls),
                active: false,
                fail_stop: self.fail_stop,
                fail_close: self.fail_close,
            }))
        }
    }

    impl DeviceStream for FlakyStream {
        fn start(&mut self) -> Result<(), DeviceError> {
            self.calls.borrow_mut().log.push("start");
            self.active = true;
            Ok(())
        }

        fn stop(&mut self) -> Result<(), DeviceError> {
            self.calls.borrow_mut().log.push("stop");
            if self.fail_stop {
                return Err(DeviceError::Stop("injected".to_string()));
            }
            self.active = false;
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active
        }

        fn close(self: Box<Self>) -> Result<(), DeviceError> {
            self.calls.borrow_mut().log.push("close");
            if self.fail_close {
                return Err(DeviceError::Close("injected".to_string()));
            }
            Ok(())
        }
    }

    fn open(fail_stop: bool, fail_close: bool) -> (AudioStream, Rc<RefCell<Calls>>) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut device = FlakyDevice {
            calls: Rc::clone(&calls),
            fail_stop,
            fail_close,
        };
        let sink = RealtimeSink::new(Arc::new(StreamState::new(16)));
        let stream = AudioStream::open(&mut device, StreamFormat::default(), sink).unwrap();
        (stream, calls)
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (mut stream, calls) = open(false, false);

        stream.start().unwrap();
        stream.start().unwrap();
        assert!(stream.is_active());

        stream.stop().unwrap();
        stream.stop().unwrap();
        assert!(!stream.is_active());

        assert_eq!(calls.borrow().log, vec!["open", "start", "stop"]);
    }

    #[test]
    fn test_teardown_proceeds_after_stop_failure() {
        let (mut stream, calls) = open(true, false);
        stream.start().unwrap();

        assert!(matches!(stream.close(), Err(DeviceError::Stop(_))));
        assert!(!stream.is_active());
        assert_eq!(calls.borrow().log, vec!["open", "start", "stop", "close"]);

        // 已关闭
        assert!(stream.close().is_ok());
        assert!(stream.start().is_err());
    }

    #[test]
    fn test_drop_closes() {
        let (mut stream, calls) = open(false, true);
        stream.start().unwrap();
        drop(stream);
        assert_eq!(calls.borrow().log, vec!["open", "start", "stop", "close"]);
    }
}
