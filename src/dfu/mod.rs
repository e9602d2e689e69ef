mod firmware;
pub(crate) mod protocol;
mod queue;
mod task;
mod transfer;

pub use self::firmware::{FirmwarePayload, FirmwareResolver, FleetDevice, HardwareIdResolver};
pub use self::protocol::{DfuFrameError, ImageSlot};
pub use self::queue::{QueueConfig, QueueEvent, UpdateQueueManager};
pub use self::task::{UpdateError, UpdateStage, UpdateSummary, UpdateTask};
pub use self::transfer::{TransferClient, TransferConfig, TransferProgress, TransferSession};
