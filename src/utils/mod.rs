//! Process-wide helpers shared by the library and the `svmasm` tool.

pub mod log;
