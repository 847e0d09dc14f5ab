//! A cooperative process runtime: a fixed pool of worker threads runs many
//! lightweight, independently-scheduled processes that communicate only by
//! synchronous rendezvous over named channels. A host program embeds the
//! runtime through [`Runtime`], spawning processes from Rust closures and
//! participating in the same channel protocol on its own thread.
//!
//! ```
//! use lucaproc::{ProcessContext, Runtime, Value};
//! use std::sync::Arc;
//!
//! let runtime = Runtime::new(2);
//! runtime.newchannel("greeting").unwrap();
//! runtime
//!     .newproc(
//!         Arc::new(|ctx: &ProcessContext| {
//!             ctx.send("greeting", vec![Value::Int(42)]).unwrap();
//!         }),
//!         Vec::new(),
//!     )
//!     .unwrap();
//! let received = runtime.receive("greeting", false).unwrap();
//! assert_eq!(received, vec![Value::Int(42)]);
//! runtime.wait();
//! runtime.shutdown();
//! ```

mod channel;
mod error;
mod process;
mod rate;
mod registry;
mod runtime;
mod scheduler;
mod stack;
mod value;

pub use error::RuntimeError;
pub use process::{ProcessBody, ProcessId};
pub use rate::RateHandle;
pub use runtime::{ProcessContext, Runtime};
pub use value::{Value, MAX_CHANNEL_PAYLOAD};
