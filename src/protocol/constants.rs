//! Connection Manager Protocol Constants

// Private payload bounds per message class. The fixed maxima follow the
// classic IB CM message layouts.
pub const MAX_REQ_PRIVATE_DATA: usize = 92;
pub const MAX_REP_PRIVATE_DATA: usize = 196;
pub const MAX_REJ_PRIVATE_DATA: usize = 148;
pub const MAX_DREQ_PRIVATE_DATA: usize = 220;

// Default negotiated-parameter values
pub const DEFAULT_RESPONDER_RESOURCES: u8 = 4;
pub const DEFAULT_INITIATOR_DEPTH: u8 = 4;
pub const DEFAULT_RETRY_COUNT: u8 = 2;
pub const DEFAULT_RNR_RETRY_COUNT: u8 = 7;
pub const DEFAULT_MAX_CM_RETRIES: u8 = 3;
pub const DEFAULT_TARGET_ACK_DELAY: u8 = 14;

// Path record defaults
pub const DEFAULT_PKEY: u16 = 0xffff;
pub const DEFAULT_RATE: u8 = 3;
pub const DEFAULT_PACKET_LIFE_TIME: u8 = 2;
pub const DEFAULT_SELECTOR: u8 = 2;
