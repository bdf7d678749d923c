/* Scripted in-memory transport for engine and registry tests. */
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::device::DeviceDescriptor;
use crate::error::TransportError;
use crate::transport::{ReadStatus, Transport, TransportHandle};

#[derive(Debug, Clone)]
pub enum MockRead {
    Report(Vec<u8>),
    Error,
}

/* Everything the handle saw, shared with the test. */
#[derive(Debug, Default)]
pub struct MockState {
    pub reads: VecDeque<MockRead>,
    /* Once the script is exhausted, fail every read instead of timing out. */
    pub fail_when_idle: bool,
    pub fail_open: bool,
    pub opens: usize,
    pub feature_reports: Vec<Vec<u8>>,
    pub lcd_frames: Vec<Vec<u8>>,
    /* How long each LCD write blocks, after its frame is recorded. */
    pub lcd_write_delay: Duration,
    /* One entry per close, holding the `skip_io` flag. */
    pub closes: Vec<bool>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    pub state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn push_report(&self, report: &[u8]) {
        self.state.lock().reads.push_back(MockRead::Report(report.to_vec()));
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn open(
        &self,
        _descriptor: &DeviceDescriptor,
    ) -> Result<Box<dyn TransportHandle>, TransportError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(TransportError::Simulated);
        }
        state.opens += 1;
        Ok(Box::new(MockHandle {
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl TransportHandle for MockHandle {
    fn send_feature_report(&mut self, report: &[u8]) -> Result<(), TransportError> {
        self.state.lock().feature_reports.push(report.to_vec());
        Ok(())
    }

    fn read_keys_interrupt(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<ReadStatus, TransportError> {
        let next = {
            let mut state = self.state.lock();
            match state.reads.pop_front() {
                Some(read) => Some(read),
                None if state.fail_when_idle => Some(MockRead::Error),
                None => None,
            }
        };
        match next {
            Some(MockRead::Report(report)) => {
                let n = report.len().min(buf.len());
                buf[..n].copy_from_slice(&report[..n]);
                Ok(ReadStatus::Data(n))
            }
            Some(MockRead::Error) => {
                std::thread::sleep(Duration::from_millis(1));
                Err(TransportError::Simulated)
            }
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
                Ok(ReadStatus::Timeout)
            }
        }
    }

    fn write_lcd_interrupt(
        &mut self,
        frame: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let delay = {
            let mut state = self.state.lock();
            state.lcd_frames.push(frame.to_vec());
            state.lcd_write_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn close(self: Box<Self>, skip_io: bool) {
        self.state.lock().closes.push(skip_io);
    }
}
