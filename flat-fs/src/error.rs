use block_dev::DeviceError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no free block left on the device")]
    NoFreeBlock,
    #[error("no free inode left in the directory")]
    NoFreeInode,
    #[error("file exceeds the largest addressable size")]
    FileTooLarge,
    #[error("protocol violation: {0}")]
    Protocol(Violation),
    #[error("no such file")]
    NotFound,
    #[error("operation not permitted in this open mode")]
    PermissionDenied,
    #[error("file is held by another handle")]
    Busy,
    #[error("seek target lies outside the file")]
    InvalidSeek,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("timed out waiting for the file")]
    TimedOut,
    #[error("device holds no flat-fs volume")]
    Unformatted,
    #[error("corrupted volume: {0}")]
    Corrupted(&'static str),
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// 写入中途失败，之前写入的块已经提交
    #[error("write aborted after {written} bytes: {source}")]
    PartialWrite {
        written: usize,
        #[source]
        source: Box<Error>,
    },
}

/// 违反块登记协议或句柄协议，说明调用方或磁盘数据有误
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("block slot is already registered")]
    SlotRegistered,
    #[error("previous block slot is empty")]
    PriorSlotEmpty,
    #[error("indirect block is missing")]
    IndirectMissing,
    #[error("direct slots are not all registered")]
    DirectsNotFull,
    #[error("handle is closed")]
    HandleClosed,
    #[error("block lies outside the data area")]
    ForeignBlock,
}

impl From<Violation> for Error {
    #[inline]
    fn from(violation: Violation) -> Self {
        Self::Protocol(violation)
    }
}
