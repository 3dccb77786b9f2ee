pub mod frame;
pub mod fs;
pub mod process;
