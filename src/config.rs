//! Compile-time stack dimensions and protocol timing constants.

/// Maximum APDU accepted from the application and from the wire.
pub const MAX_APDU_SIZE: usize = 228;

/// Length of a device Unique ID (Neuron ID or MAC ID).
pub const UNIQUE_ID_LEN: usize = 6;

/// Maximum length of a domain ID.
pub const DOMAIN_ID_LEN: usize = 6;

/// Length of the application program ID.
pub const PROGRAM_ID_LEN: usize = 8;

/// Classic authentication key length (one per domain entry).
pub const AUTH_KEY_LEN: usize = 6;

/// Open-media authentication key length (spans both domain slots).
pub const OMA_KEY_LEN: usize = 12;

/// Number of domain table entries.
pub const NUM_DOMAINS: usize = 2;

/// Address table capacity.
pub const NUM_ADDR_TBL_ENTRIES: usize = 254;

/// Highest group member number; the ack bitmap covers `0..=MAX_GROUP_MEMBER`.
pub const MAX_GROUP_MEMBER: usize = 63;

/// Receive-transaction (duplicate detection) record pool size.
pub const RECEIVE_TRANS_COUNT: usize = 16;

/// Destination entries per transaction-ID table (one table per priority).
pub const TID_TABLE_SIZE: usize = 10;

/// Minimum time a TID table entry must age before it can be evicted.  Kept
/// above the longest receive timer deployed peers use, so a reused
/// destination/TID pair cannot alias a still-live receive record.
pub const MIN_TABLE_TIME_MS: u16 = 24_000;

/// The last `ALT_PATH_COUNT + 1` retries of a transaction go out on the
/// alternate path.
pub const ALT_PATH_COUNT: u8 = 1;

/// Transport/session send quiet period after power-up or external reset.
pub const TS_RESET_DELAY_MS: u16 = 2000;

/// Receive-timer value for unique-ID addressed messages.
pub const UNIQUE_ID_RECV_TIMER_MS: u16 = 8192;

/// How often the link driver retries the Unique ID read at startup.
pub const UID_FETCH_INTERVAL_MS: u16 = 500;

/// How often power-line transceiver parameters are sampled.
pub const XCVR_FETCH_INTERVAL_MS: u16 = 10_000;

/// Service-LED housekeeping cadence.
pub const LED_TIMER_MS: u16 = 2000;

/// Configuration-checksum verification cadence.
pub const CHECKSUM_TIMER_MS: u16 = 1000;

/// Debounce before a configuration change is flushed to persistent storage.
pub const PERSISTENT_FLUSH_GUARD_MS: u16 = 1000;

/// Number of stored transceiver-status registers.
pub const NUM_COMM_PARAMS: usize = 7;

/// Tag nibble reserved for the stack's own local network management
/// exchanges with the network interface.
pub const LOCAL_NM_TAG: u8 = 0x0F;

// Default buffer dimension codes (Neuron encoding, decoded at reset by the
// tables in `node`).
pub const APP_IN_BUF_SIZE_CODE: u8 = 0;
pub const APP_OUT_BUF_SIZE_CODE: u8 = 0;
pub const NW_IN_BUF_SIZE_CODE: u8 = 0;
pub const NW_OUT_BUF_SIZE_CODE: u8 = 0;
pub const APP_IN_Q_CNT_CODE: u8 = 5;
pub const APP_OUT_Q_CNT_CODE: u8 = 5;
pub const APP_OUT_PRI_Q_CNT_CODE: u8 = 3;
pub const NW_IN_Q_CNT_CODE: u8 = 5;
pub const NW_OUT_Q_CNT_CODE: u8 = 5;
pub const NW_OUT_PRI_Q_CNT_CODE: u8 = 3;
