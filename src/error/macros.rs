//! # 错误处理宏

/// 快速创建配置错误的宏
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::RelayError::config($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RelayError::config(format!($fmt, $($arg)*))
    };
}

/// 快速创建数据库错误的宏
#[macro_export]
macro_rules! database_error {
    ($msg:expr) => {
        $crate::error::RelayError::database($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RelayError::database(format!($fmt, $($arg)*))
    };
}

/// 快速创建转换错误的宏
#[macro_export]
macro_rules! translation_error {
    ($msg:expr) => {
        $crate::error::RelayError::translation($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RelayError::translation(format!($fmt, $($arg)*))
    };
}

/// 快速创建请求参数错误的宏
#[macro_export]
macro_rules! invalid_request {
    ($msg:expr) => {
        $crate::error::RelayError::invalid_request($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RelayError::invalid_request(format!($fmt, $($arg)*))
    };
}

/// 快速创建内部错误的宏
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::RelayError::internal($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RelayError::internal(format!($fmt, $($arg)*))
    };
}

/// 确保条件成立，否则返回配置错误
#[macro_export]
macro_rules! ensure_config {
    ($cond:expr, $msg:expr) => {
        if !($cond) {
            return Err($crate::config_error!($msg));
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::config_error!($fmt, $($arg)*));
        }
    };
}

/// 确保条件成立，否则返回请求参数错误
#[macro_export]
macro_rules! ensure_request {
    ($cond:expr, $msg:expr) => {
        if !($cond) {
            return Err($crate::invalid_request!($msg));
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            return Err($crate::invalid_request!($fmt, $($arg)*));
        }
    };
}
