// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BlueZ bus names and the UUIDs of the peripheral's services.

use uuid::Uuid;

/// Well-known bus name of bluetoothd.
pub const BLUEZ_SERVICE: &str = "org.bluez";

/// Object path of the BlueZ manager objects.
pub const BLUEZ_ROOT_PATH: &str = "/org/bluez";

pub const AGENT_INTERFACE: &str = "org.bluez.Agent1";
pub const AGENT_MANAGER_INTERFACE: &str = "org.bluez.AgentManager1";
pub const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Root of the attribute tree object paths.
pub const APPLICATION_PATH: &str = "/org/bluez/bincapplication";

/// Build a UUID from a 16-bit Bluetooth SIG short UUID.
pub const fn short_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

// Authentication service
pub const AUTH_SERVICE_UUID: Uuid = short_uuid(0xa000);
pub const PASSWORD_CHAR_UUID: Uuid = short_uuid(0xa001);
pub const IS_AUTHENTICATED_CHAR_UUID: Uuid = short_uuid(0xa002);

// Vehicle service, installed once a central has authenticated
pub const VEHICLE_SERVICE_UUID: Uuid = short_uuid(0x1809);
pub const CAN_CHAR_UUID: Uuid = short_uuid(0x2a10);
pub const GPS_CHAR_UUID: Uuid = short_uuid(0x2a11);
pub const GPS_FREQ_CHAR_UUID: Uuid = short_uuid(0x2a12);
pub const CAN_FREQ_CHAR_UUID: Uuid = short_uuid(0x2a13);
pub const IMU_FREQ_CHAR_UUID: Uuid = short_uuid(0x2a14);
pub const UNLOCK_VEHICLE_CHAR_UUID: Uuid = short_uuid(0x2a15);

/// Characteristic User Description descriptor.
pub const CUD_DESCRIPTOR_UUID: Uuid = short_uuid(0x2901);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid_expansion() {
        assert_eq!(
            AUTH_SERVICE_UUID.to_string(),
            "0000a000-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            VEHICLE_SERVICE_UUID.to_string(),
            "00001809-0000-1000-8000-00805f9b34fb"
        );
    }
}
