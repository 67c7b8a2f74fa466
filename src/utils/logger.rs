//! 日志模块
//!
//! 统一从这里引入日志宏，方便后续整体替换日志后端

pub use rat_logger::{debug, error, info, warn};
