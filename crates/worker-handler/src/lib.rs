//! Serverless job handler for the ComfyUI worker.
//!
//! Each job carries a prompt and an image URL. The handler downloads the
//! image into the GUI server's input directory, patches the bundled
//! workflow, queues it, waits for the rendered video and uploads it to
//! object storage.
//!
//! ```text
//! JobSource ──► run_worker ──► JobHandler ──► ComfyClient ──► GUI server
//!     ▲                            │
//!     └──────── result ◄───────────┴──► ObjectStore (R2)
//! ```

pub mod comfy;
pub mod error;
pub mod pipeline;
pub mod serverless;
pub mod settings;
pub mod storage;
pub mod workflow;

pub use comfy::{ComfyClient, ComfyError, VideoOutput};
pub use error::HandlerError;
pub use pipeline::{JobDebug, JobHandler, JobInput, JobOutput};
pub use serverless::{
    Job, JobSource, LocalJobSource, RunpodEndpoints, RunpodJobSource, ServerlessError, run_worker,
};
pub use settings::{HandlerSettings, R2Settings, StorageSettings};
pub use storage::{ObjectStore, R2Store, StorageError};
