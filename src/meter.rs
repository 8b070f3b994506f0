use std::io::Read;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Hard ceiling for a single attempt.
pub const MAX_BYTES_PER_ATTEMPT: u64 = 100 * 1024 * 1024;

const CHUNK_SIZE: usize = 8192;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Source of bytes for one measurement attempt.
pub trait Transfer {
    fn open(&self, target: &str) -> Result<Box<dyn Read + Send>, TransferError>;
}

/// HTTP GET with pooled connections.
pub struct HttpTransfer {
    client: reqwest::blocking::Client,
}

impl HttpTransfer {
    pub fn new() -> Result<Self, TransferError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(5)
            .build()?;
        Ok(Self { client })
    }
}

impl Transfer for HttpTransfer {
    fn open(&self, target: &str) -> Result<Box<dyn Read + Send>, TransferError> {
        let response = self.client.get(target).send()?.error_for_status()?;
        Ok(Box::new(response))
    }
}

#[derive(Debug)]
pub struct Measurement {
    pub bytes: u64,
    pub elapsed: Duration,
    /// Transport failure, if any. `bytes` is zero when set.
    pub error: Option<String>,
}

impl Measurement {
    pub fn speed_mbps(&self) -> f64 {
        speed_mbps(self.bytes, self.elapsed.as_secs_f64())
    }
}

/// Megabits per second, counting 2^20 bits per megabit. Zero when no time elapsed.
pub fn speed_mbps(bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (1024.0 * 1024.0) / elapsed_secs
}

/// Pull up to `cap` bytes from `target`, checking `interrupted` before every chunk.
///
/// An interruption ends the attempt early with the partial count. A transport
/// failure is reported in [`Measurement::error`] with a zero byte count.
pub fn measure<T: Transfer + ?Sized>(
    transfer: &T,
    target: &str,
    cap: u64,
    interrupted: &mut dyn FnMut() -> bool,
) -> Measurement {
    let start = Instant::now();
    let mut bytes = 0u64;
    let result = transfer.open(target).and_then(|mut body| {
        let mut buf = [0u8; CHUNK_SIZE];
        while bytes < cap {
            if interrupted() {
                break;
            }
            let n = body.read(&mut buf)?;
            if n == 0 {
                break;
            }
            bytes += n as u64;
        }
        Ok(())
    });

    match result {
        Ok(()) => Measurement { bytes, elapsed: start.elapsed(), error: None },
        Err(e) => Measurement {
            bytes: 0,
            elapsed: start.elapsed(),
            error: Some(e.to_string()),
        },
    }
}
