pub mod cancel;
pub mod fs_atomic;
pub mod ids;
pub mod logging;
pub mod time;
