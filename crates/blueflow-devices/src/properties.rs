/*!
 * Characteristic properties and descriptor permissions.
 *
 * These gate the leaf value machines: an operation the attribute does not
 * advertise is refused locally.
 */
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::transport::WriteMode;

/// Set of GATT characteristic properties
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// Value may be broadcast in advertisements
    pub const BROADCAST: Self = Self(0x01);
    /// Value may be read
    pub const READ: Self = Self(0x02);
    /// Value may be written without a response
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    /// Value may be written with a response
    pub const WRITE: Self = Self(0x08);
    /// Value changes may be notified
    pub const NOTIFY: Self = Self(0x10);
    /// Value changes may be indicated
    pub const INDICATE: Self = Self(0x20);
    /// Value may be written with a signature
    pub const AUTHENTICATED_SIGNED_WRITES: Self = Self(0x40);
    /// Further properties live in the extended properties descriptor
    pub const EXTENDED_PROPERTIES: Self = Self(0x80);

    const NAMES: [(Self, &'static str); 8] = [
        (Self::BROADCAST, "broadcast"),
        (Self::READ, "read"),
        (Self::WRITE_WITHOUT_RESPONSE, "write-without-response"),
        (Self::WRITE, "write"),
        (Self::NOTIFY, "notify"),
        (Self::INDICATE, "indicate"),
        (Self::AUTHENTICATED_SIGNED_WRITES, "authenticated-signed-writes"),
        (Self::EXTENDED_PROPERTIES, "extended-properties"),
    ];

    /// No properties
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from the raw property byte
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// The raw property byte
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether every property in `other` is set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any property in `other` is set
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether the value may be read
    pub fn can_read(self) -> bool {
        self.contains(Self::READ)
    }

    /// Whether the value may be written in `mode`
    pub fn can_write(self, mode: WriteMode) -> bool {
        match mode {
            WriteMode::WithResponse => self.contains(Self::WRITE),
            WriteMode::WithoutResponse => self.contains(Self::WRITE_WITHOUT_RESPONSE),
        }
    }

    /// Whether notifications or indications may be enabled
    pub fn can_notify(self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CharacteristicProperties {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for CharacteristicProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Access permissions of a descriptor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributePermissions {
    /// Descriptor may be read
    pub readable: bool,
    /// Descriptor may be written
    pub writeable: bool,
}

impl AttributePermissions {
    /// Readable and writeable
    pub const READ_WRITE: Self = Self {
        readable: true,
        writeable: true,
    };

    /// Readable only
    pub const READ_ONLY: Self = Self {
        readable: true,
        writeable: false,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gates() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert!(props.can_read());
        assert!(props.can_notify());
        assert!(!props.can_write(WriteMode::WithResponse));
        assert!(!props.can_write(WriteMode::WithoutResponse));

        let write_only = CharacteristicProperties::from_bits(0x04);
        assert!(write_only.can_write(WriteMode::WithoutResponse));
        assert!(!write_only.can_write(WriteMode::WithResponse));
        assert!(!write_only.can_read());

        assert!(CharacteristicProperties::INDICATE.can_notify());
        assert!(!CharacteristicProperties::empty().can_notify());
    }

    #[test]
    fn test_display() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::WRITE;
        assert_eq!(props.to_string(), "read, write");
        assert_eq!(props.bits(), 0x0a);
    }
}
