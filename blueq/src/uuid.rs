use uuid::Uuid;

use crate::{Error, Result};

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Client Characteristic Configuration descriptor, written to turn
/// notifications and indications on and off
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid_from_u16(0x2902);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

pub trait BluetoothUuid {
    fn as_u16(&self) -> Option<u16>;
    fn as_u32(&self) -> Option<u32>;
}

impl BluetoothUuid for Uuid {
    fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn as_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_32 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }
}

// Const so that apps can declare well known characteristics as consts

pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}
pub const fn uuid_from_u32(v: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

/// Parses a characteristic or descriptor id the way remote clients send them
///
/// Accepts the full 128-bit form as well as the 16 and 32 bit short forms
/// ("2902", "0000180d") that are relative to the Bluetooth base UUID.
pub fn parse_uuid(s: &str) -> Result<Uuid> {
    let s = s.trim();
    let short = match s.len() {
        4 => u16::from_str_radix(s, 16).ok().map(uuid_from_u16),
        8 => u32::from_str_radix(s, 16).ok().map(uuid_from_u32),
        _ => None,
    };
    match short {
        Some(uuid) => Ok(uuid),
        None => Uuid::parse_str(s)
            .map_err(|err| Error::Other(anyhow::anyhow!("Invalid UUID {:?}: {}", s, err))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_forms() {
        assert_eq!(CLIENT_CHARACTERISTIC_CONFIGURATION.to_string(),
                   "00002902-0000-1000-8000-00805f9b34fb");
        assert_eq!(CLIENT_CHARACTERISTIC_CONFIGURATION.as_u16(), Some(0x2902));
        assert_eq!(parse_uuid("2902").unwrap(), CLIENT_CHARACTERISTIC_CONFIGURATION);
        assert_eq!(parse_uuid("0000a001").unwrap().as_u16(), Some(0xa001));

        let custom = parse_uuid("18c2a267-a539-4423-aecc-edeeb2784bcc").unwrap();
        assert_eq!(custom.as_u16(), None);
        assert_eq!(custom.as_u32(), None);

        assert!(parse_uuid("not-a-uuid").is_err());
    }
}
