//! worker-launch — container entrypoint logic.
//!
//! ```text
//! Launcher::run()
//!   ├── spawn GUI server (background, 127.0.0.1:8188)
//!   ├── wait_until_ready()  ←→  server exit  ←→  SIGTERM/SIGINT
//!   ├── spawn handler (foreground, inherits stdio)
//!   ├── forward SIGTERM/SIGINT to the handler until it exits
//!   ├── terminate + reap the server
//!   └── exit code = handler's exit code
//! ```
//!
//! The launcher does not restart either process. If the server dies while
//! the handler is running it is logged and the handler's own requests
//! surface the failure.

pub mod launcher;
pub mod process;

pub use launcher::{LaunchError, Launcher};
pub use process::exit_code;
