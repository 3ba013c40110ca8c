//! Bluetooth SIG UUID helpers

use uuid::Uuid;

/// Base UUID for 16-bit SIG assigned numbers
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb);

/// User Data service
pub const USER_DATA_SERVICE_UUID: Uuid = from_short(0x181c);

/// Database Change Increment characteristic
pub const DATABASE_CHANGE_INCREMENT_UUID: Uuid = from_short(0x2a99);

/// Client Characteristic Configuration descriptor
pub const CCCD_UUID: Uuid = from_short(0x2902);

/// Expand a 16-bit assigned number into a full UUID
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((short as u128) << 96))
}

/// Short form of a SIG UUID, if it is one
pub fn to_short(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let short = (value >> 96) as u16;
    (from_short(short).as_u128() == value).then_some(short)
}

/// Parse a UUID given either as 4 hex digits or in full
pub fn parse_uuid(s: &str) -> Result<Uuid, String> {
    if s.len() == 4 {
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid short UUID '{}'", s));
        }
        return u16::from_str_radix(s, 16)
            .map(from_short)
            .map_err(|e| format!("invalid short UUID '{}': {}", s, e));
    }
    Uuid::parse_str(s).map_err(|e| format!("invalid UUID '{}': {}", s, e))
}
