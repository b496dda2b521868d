// Vendor error code classification. Codes follow the common RTC SDK numbering
// (positive values; some SDK builds report them negated).

use crate::engine::JoinFailureKind;

pub const ERR_INVALID_ARGUMENT: i32 = 2;
pub const ERR_NOT_READY: i32 = 7;
pub const ERR_INVALID_STATE: i32 = 8;
pub const ERR_TIMEDOUT: i32 = 10;
pub const ERR_JOIN_CHANNEL_REJECTED: i32 = 17;
pub const ERR_INVALID_APP_ID: i32 = 101;
pub const ERR_INVALID_CHANNEL_NAME: i32 = 102;
pub const ERR_TOKEN_EXPIRED: i32 = 109;
pub const ERR_INVALID_TOKEN: i32 = 110;

pub fn classify_vendor_code(code: i32) -> JoinFailureKind {
    match code.saturating_abs() {
        ERR_TOKEN_EXPIRED | ERR_INVALID_TOKEN => JoinFailureKind::TokenExpired,
        ERR_INVALID_ARGUMENT | ERR_INVALID_APP_ID | ERR_INVALID_CHANNEL_NAME => {
            JoinFailureKind::Fatal
        }
        ERR_NOT_READY | ERR_INVALID_STATE | ERR_TIMEDOUT | ERR_JOIN_CHANNEL_REJECTED => {
            JoinFailureKind::Transient
        }
        _ => JoinFailureKind::Transient,
    }
}

pub fn describe_vendor_code(code: i32) -> String {
    let text = match code.saturating_abs() {
        ERR_INVALID_ARGUMENT => "invalid argument",
        ERR_NOT_READY => "engine not ready",
        ERR_INVALID_STATE => "engine in invalid state",
        ERR_TIMEDOUT => "request timed out",
        ERR_JOIN_CHANNEL_REJECTED => "join channel rejected",
        ERR_INVALID_APP_ID => "invalid app id",
        ERR_INVALID_CHANNEL_NAME => "invalid channel name",
        ERR_TOKEN_EXPIRED => "channel token expired",
        ERR_INVALID_TOKEN => "invalid channel token",
        _ => return format!("vendor error {code}"),
    };
    format!("{text} ({code})")
}
