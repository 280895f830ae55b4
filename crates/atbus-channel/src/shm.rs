use shared_memory::{ShmemConf, ShmemError};
use tracing::warn;

use crate::{RingChannel, RingConf, RingError};

fn os_id(key: u64) -> String {
    format!("atbus_shm_{key}")
}

/// Ring channel over a named shared-memory segment, addressed as
/// `shm://<decimal key>`.
///
/// The mapping is leaked on purpose: views stay valid for the process
/// lifetime and reattach cheaply, the same segment is shared by every
/// handle with the same key.
#[derive(Debug)]
pub struct ShmRing {
    key: u64,
    len: usize,
    chan: RingChannel,
}

impl ShmRing {
    /// Map (creating if needed) the segment for `key` and lay out a
    /// channel over it. Used by the listening side.
    pub fn create_or_open(key: u64, len: usize, conf: Option<RingConf>) -> Result<Self, RingError> {
        match ShmemConf::new().size(len).os_id(os_id(key)).create() {
            Ok(mapping) => {
                let ptr = mapping.as_ptr();
                let mapped = mapping.len();
                std::mem::forget(mapping);
                let chan = unsafe { RingChannel::init(ptr, mapped, conf) }?;
                Ok(Self { key, len: mapped, chan })
            }
            Err(ShmemError::MappingIdExists | ShmemError::LinkExists) => Self::open(key),
            Err(err) => {
                warn!(key, ?err, "shm segment create failed");
                Err(RingError::ShmGetFailed)
            }
        }
    }

    /// Attach to an existing segment. Used by the sending side.
    pub fn open(key: u64) -> Result<Self, RingError> {
        let mapping = ShmemConf::new().os_id(os_id(key)).open().map_err(|err| {
            warn!(key, ?err, "shm segment open failed");
            RingError::ShmNotFound
        })?;

        let ptr = mapping.as_ptr();
        let mapped = mapping.len();
        std::mem::forget(mapping);

        // the creator may still be laying out the head
        let mut tries = 0;
        loop {
            match unsafe { RingChannel::attach(ptr, mapped) } {
                Ok(chan) => return Ok(Self { key, len: mapped, chan }),
                Err(RingError::Params) if tries < 10 => {
                    tries += 1;
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn channel(&self) -> RingChannel {
        self.chan
    }
}
