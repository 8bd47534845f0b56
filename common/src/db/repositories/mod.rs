// Repository layer for database operations

pub mod batch;
pub mod dead_letter;
pub mod file;
pub mod heartbeat;

pub use batch::BatchJobRepository;
pub use dead_letter::DeadLetterRepository;
pub use file::FileRepository;
pub use heartbeat::HeartbeatRepository;
