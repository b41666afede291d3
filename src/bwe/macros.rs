macro_rules! log_delay_variation {
    ($($arg:expr),+) => {
        crate::macros::log_stat!("DELAY_VARIATION", $($arg),+);
    }
}

macro_rules! log_delay_estimate {
    ($($arg:expr),+) => {
        crate::macros::log_stat!("DELAY_ESTIMATE", $($arg),+);
    }
}

macro_rules! log_bitrate_estimate {
    ($($arg:expr),+) => {
        crate::macros::log_stat!("BITRATE_ESTIMATE", $($arg),+);
    }
}

macro_rules! log_loss {
    ($($arg:expr),+) => {
        crate::macros::log_stat!("LOSS", $($arg),+);
    }
}

macro_rules! log_loss_bitrate_estimate {
    ($($arg:expr),+) => {
        crate::macros::log_stat!("LOSS_BITRATE_ESTIMATE", $($arg),+);
    }
}

macro_rules! log_rate_control_state {
    ($($arg:expr),+) => {
        crate::macros::log_stat!("RATE_CONTROL_STATE", $($arg),+);
    }
}

macro_rules! log_target_bitrate {
    ($($arg:expr),+) => {
        crate::macros::log_stat!("TARGET_BITRATE", $($arg),+);
    }
}

pub(crate) use log_bitrate_estimate;
pub(crate) use log_delay_estimate;
pub(crate) use log_delay_variation;
pub(crate) use log_loss;
pub(crate) use log_loss_bitrate_estimate;
pub(crate) use log_rate_control_state;
pub(crate) use log_target_bitrate;
