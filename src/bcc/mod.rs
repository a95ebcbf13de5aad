mod context;
mod process;
mod render;
mod signals;
mod sym;

pub use context::{effective_defines, ContextBuilder, GlobalContext, UprobeContext};
pub use process::BccProcess;
pub use render::{render, AttachSpec, RenderProbe};
pub use signals::{block_all, unblock_all};
pub use sym::SymProcess;
