pub mod allocator;
pub mod daemon;
pub mod enforcer;
pub mod launcher;
pub mod probe;
pub mod process;
pub mod quota;
