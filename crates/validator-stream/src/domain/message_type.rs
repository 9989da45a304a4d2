//! Closed registry of validator message kinds.
//!
//! Tags match the `Message.MessageType` enum of the validator wire schema.
//! Anything outside this table is rejected by the codec.

use std::fmt;

/// Message kind carried in every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    Default = 0,

    // ═══════════════════════════════════════════════════════════════════════
    // PROCESSOR REGISTRATION
    // ═══════════════════════════════════════════════════════════════════════
    TpRegisterRequest = 1,
    TpRegisterResponse = 2,
    TpUnregisterRequest = 3,
    TpUnregisterResponse = 4,

    // ═══════════════════════════════════════════════════════════════════════
    // TRANSACTION PROCESSING (validator → processor)
    // ═══════════════════════════════════════════════════════════════════════
    TpProcessRequest = 5,
    TpProcessResponse = 6,

    // ═══════════════════════════════════════════════════════════════════════
    // STATE ACCESS (processor → validator)
    // ═══════════════════════════════════════════════════════════════════════
    TpStateGetRequest = 7,
    TpStateGetResponse = 8,
    TpStateSetRequest = 9,
    TpStateSetResponse = 10,
    TpStateDeleteRequest = 11,
    TpStateDeleteResponse = 12,

    // ═══════════════════════════════════════════════════════════════════════
    // EXECUTION RESULTS
    // ═══════════════════════════════════════════════════════════════════════
    TpReceiptAddDataRequest = 13,
    TpReceiptAddDataResponse = 14,
    TpEventAddRequest = 15,
    TpEventAddResponse = 16,

    // ═══════════════════════════════════════════════════════════════════════
    // LIVENESS
    // ═══════════════════════════════════════════════════════════════════════
    PingRequest = 900,
    PingResponse = 901,
}

impl MessageType {
    /// Every known kind, in tag order.
    pub const ALL: [MessageType; 19] = [
        MessageType::Default,
        MessageType::TpRegisterRequest,
        MessageType::TpRegisterResponse,
        MessageType::TpUnregisterRequest,
        MessageType::TpUnregisterResponse,
        MessageType::TpProcessRequest,
        MessageType::TpProcessResponse,
        MessageType::TpStateGetRequest,
        MessageType::TpStateGetResponse,
        MessageType::TpStateSetRequest,
        MessageType::TpStateSetResponse,
        MessageType::TpStateDeleteRequest,
        MessageType::TpStateDeleteResponse,
        MessageType::TpReceiptAddDataRequest,
        MessageType::TpReceiptAddDataResponse,
        MessageType::TpEventAddRequest,
        MessageType::TpEventAddResponse,
        MessageType::PingRequest,
        MessageType::PingResponse,
    ];

    /// Integer tag used on the wire.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Schema name of the kind (e.g. `TP_STATE_GET_REQUEST`).
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Default => "DEFAULT",
            MessageType::TpRegisterRequest => "TP_REGISTER_REQUEST",
            MessageType::TpRegisterResponse => "TP_REGISTER_RESPONSE",
            MessageType::TpUnregisterRequest => "TP_UNREGISTER_REQUEST",
            MessageType::TpUnregisterResponse => "TP_UNREGISTER_RESPONSE",
            MessageType::TpProcessRequest => "TP_PROCESS_REQUEST",
            MessageType::TpProcessResponse => "TP_PROCESS_RESPONSE",
            MessageType::TpStateGetRequest => "TP_STATE_GET_REQUEST",
            MessageType::TpStateGetResponse => "TP_STATE_GET_RESPONSE",
            MessageType::TpStateSetRequest => "TP_STATE_SET_REQUEST",
            MessageType::TpStateSetResponse => "TP_STATE_SET_RESPONSE",
            MessageType::TpStateDeleteRequest => "TP_STATE_DELETE_REQUEST",
            MessageType::TpStateDeleteResponse => "TP_STATE_DELETE_RESPONSE",
            MessageType::TpReceiptAddDataRequest => "TP_RECEIPT_ADD_DATA_REQUEST",
            MessageType::TpReceiptAddDataResponse => "TP_RECEIPT_ADD_DATA_RESPONSE",
            MessageType::TpEventAddRequest => "TP_EVENT_ADD_REQUEST",
            MessageType::TpEventAddResponse => "TP_EVENT_ADD_RESPONSE",
            MessageType::PingRequest => "PING_REQUEST",
            MessageType::PingResponse => "PING_RESPONSE",
        }
    }
}

impl TryFrom<i32> for MessageType {
    /// The unrecognised tag.
    type Error = i32;

    fn try_from(tag: i32) -> Result<Self, Self::Error> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_i32() == tag)
            .ok_or(tag)
    }
}

impl From<MessageType> for i32 {
    fn from(kind: MessageType) -> Self {
        kind.as_i32()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_i32())
    }
}
