use crate::accessory_store::AccessoryInfo;
use crate::error::PublishError;
use crate::value_mapper::ChargingState;
use std::{
    collections::HashMap,
    future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio_modbus::prelude::*;
use tracing::{debug, trace};

/// Register layout of the accessory.
/// Float characteristics take two registers, high word first.
pub mod registers {
    pub const LAYOUT_VERSION: u16 = 0;
    pub const NAME: u16 = 1;
    pub const NAME_LEN: u16 = 16;
    pub const SERIAL_NUMBER: u16 = 17;
    pub const SERIAL_NUMBER_LEN: u16 = 16;
    pub const MANUFACTURER: u16 = 33;
    pub const MANUFACTURER_LEN: u16 = 8;
    pub const MODEL: u16 = 41;
    pub const MODEL_LEN: u16 = 8;

    pub const TEMPERATURE: u16 = 100;
    pub const CHARGING_STATE: u16 = 102;
    pub const BATTERY_LEVEL: u16 = 103;
    pub const LIGHT_LEVEL: u16 = 104;
    pub const LIGHT_MAX: u16 = 106;
}

const LAYOUT_VERSION: u16 = 1;

const TEMP_MIN: f64 = 0.0;
const TEMP_MAX: f64 = 100.0;
const BATTERY_LEVEL_MAX: u8 = 100;
const DEFAULT_LIGHT_MAX: f64 = 100_000.0;

/// Set-value operations for each characteristic the bridge publishes
pub trait AccessoryPublisher: Send {
    fn set_temperature(&mut self, celsius: f64) -> Result<(), PublishError>;
    fn set_charging_state(&mut self, state: ChargingState) -> Result<(), PublishError>;
    fn set_battery_level(&mut self, percent: u8) -> Result<(), PublishError>;
    fn set_light_max(&mut self, max: f64) -> Result<(), PublishError>;
    fn set_light_level(&mut self, level: f64) -> Result<(), PublishError>;
}

type Registers = Arc<Mutex<HashMap<u16, u16>>>;

fn lock(registers: &Registers) -> MutexGuard<'_, HashMap<u16, u16>> {
    registers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only view of the accessory, served to controllers over Modbus
#[derive(Clone)]
pub struct InverterAccessory {
    registers: Registers,
}

/// The single write path into the accessory state
pub struct AccessoryHandle {
    registers: Registers,
    light_max: f64,
}

/// Current characteristic values as a controller would read them
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccessoryReadout {
    pub temperature: f32,
    pub charging_state: Option<ChargingState>,
    pub battery_level: u16,
    pub light_level: f32,
    pub light_max: f32,
}

impl tokio_modbus::server::Service for InverterAccessory {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        let res = match req {
            Request::ReadInputRegisters(addr, cnt) => {
                register_read(&lock(&self.registers), addr, cnt).map(Response::ReadInputRegisters)
            }
            Request::ReadHoldingRegisters(addr, cnt) => {
                register_read(&lock(&self.registers), addr, cnt)
                    .map(Response::ReadHoldingRegisters)
            }
            _ => {
                debug!("rejecting unsupported request {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

impl InverterAccessory {
    /// Creates the accessory and the handle that owns all writes to it
    pub fn new(info: &AccessoryInfo) -> (Self, AccessoryHandle) {
        let mut regs = HashMap::new();
        regs.insert(registers::LAYOUT_VERSION, LAYOUT_VERSION);
        write_string(&mut regs, registers::NAME, registers::NAME_LEN, &info.name);
        write_string(
            &mut regs,
            registers::SERIAL_NUMBER,
            registers::SERIAL_NUMBER_LEN,
            &info.serial_number,
        );
        write_string(
            &mut regs,
            registers::MANUFACTURER,
            registers::MANUFACTURER_LEN,
            &info.manufacturer,
        );
        write_string(
            &mut regs,
            registers::MODEL,
            registers::MODEL_LEN,
            &info.model,
        );

        write_f32(&mut regs, registers::TEMPERATURE, 0.0);
        regs.insert(
            registers::CHARGING_STATE,
            ChargingState::NotCharging.as_u16(),
        );
        regs.insert(registers::BATTERY_LEVEL, 0);
        write_f32(&mut regs, registers::LIGHT_LEVEL, 0.0);
        write_f32(&mut regs, registers::LIGHT_MAX, DEFAULT_LIGHT_MAX as f32);

        let registers = Arc::new(Mutex::new(regs));
        (
            Self {
                registers: registers.clone(),
            },
            AccessoryHandle {
                registers,
                light_max: DEFAULT_LIGHT_MAX,
            },
        )
    }

    pub fn readout(&self) -> AccessoryReadout {
        let regs = lock(&self.registers);
        let get = |addr: u16| regs.get(&addr).copied().unwrap_or_default();
        let get_f32 = |addr: u16| merge_u16_f32(get(addr), get(addr + 1));
        AccessoryReadout {
            temperature: get_f32(registers::TEMPERATURE),
            charging_state: ChargingState::from_u16(get(registers::CHARGING_STATE)),
            battery_level: get(registers::BATTERY_LEVEL),
            light_level: get_f32(registers::LIGHT_LEVEL),
            light_max: get_f32(registers::LIGHT_MAX),
        }
    }
}

impl AccessoryHandle {
    fn set_f32(&self, register: u16, value: f64) {
        write_f32(&mut lock(&self.registers), register, value as f32);
    }

    fn set_u16(&self, register: u16, value: u16) {
        lock(&self.registers).insert(register, value);
    }
}

impl AccessoryPublisher for AccessoryHandle {
    fn set_temperature(&mut self, celsius: f64) -> Result<(), PublishError> {
        let celsius = finite("temperature", celsius)?.clamp(TEMP_MIN, TEMP_MAX);
        trace!(celsius, "set temperature");
        self.set_f32(registers::TEMPERATURE, celsius);
        Ok(())
    }

    fn set_charging_state(&mut self, state: ChargingState) -> Result<(), PublishError> {
        trace!(?state, "set charging state");
        self.set_u16(registers::CHARGING_STATE, state.as_u16());
        Ok(())
    }

    fn set_battery_level(&mut self, percent: u8) -> Result<(), PublishError> {
        if percent > BATTERY_LEVEL_MAX {
            return Err(PublishError::OutOfRange {
                characteristic: "battery level",
                value: percent.into(),
                min: 0.0,
                max: BATTERY_LEVEL_MAX.into(),
            });
        }
        trace!(percent, "set battery level");
        self.set_u16(registers::BATTERY_LEVEL, percent.into());
        Ok(())
    }

    fn set_light_max(&mut self, max: f64) -> Result<(), PublishError> {
        let max = finite("light max", max)?;
        if max < 0.0 {
            return Err(PublishError::OutOfRange {
                characteristic: "light max",
                value: max,
                min: 0.0,
                max: f64::MAX,
            });
        }
        trace!(max, "set light max");
        self.light_max = max;
        self.set_f32(registers::LIGHT_MAX, max);
        Ok(())
    }

    fn set_light_level(&mut self, level: f64) -> Result<(), PublishError> {
        let level = finite("light level", level)?.clamp(0.0, self.light_max);
        trace!(level, "set light level");
        self.set_f32(registers::LIGHT_LEVEL, level);
        Ok(())
    }
}

fn finite(characteristic: &'static str, value: f64) -> Result<f64, PublishError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(PublishError::NotFinite { characteristic })
    }
}

fn write_f32(registers: &mut HashMap<u16, u16>, register_base_number: u16, value: f32) {
    let int_encoding: u32 = value.to_bits();
    registers.insert(register_base_number, (int_encoding >> 16) as u16);
    registers.insert(register_base_number + 1, (int_encoding & 0xFFFF) as u16);
}

/// ASCII, two characters per register, NUL padded and truncated to fit
fn write_string(registers: &mut HashMap<u16, u16>, base: u16, len: u16, value: &str) {
    let mut bytes = value
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .take(usize::from(len) * 2);
    for offset in 0..len {
        let high = bytes.next().unwrap_or(0);
        let low = bytes.next().unwrap_or(0);
        registers.insert(base + offset, u16::from_be_bytes([high, low]));
    }
}

/// Converts two u16 values (high word first) into a f32
pub fn merge_u16_f32(high: u16, low: u16) -> f32 {
    f32::from_bits(((high as u32) << 16) | (low as u32))
}

/// Inverse of the register string encoding, stopping at the first NUL
pub fn decode_string(words: &[u16]) -> String {
    words
        .iter()
        .flat_map(|word| word.to_be_bytes())
        .take_while(|&byte| byte != 0)
        .map(char::from)
        .collect()
}

/// Helper function implementing reading registers from a HashMap.
fn register_read(
    registers: &HashMap<u16, u16>,
    addr: u16,
    cnt: u16,
) -> Result<Vec<u16>, ExceptionCode> {
    let mut response_values = vec![0; cnt.into()];
    for i in 0..cnt {
        let Some(reg_addr) = addr.checked_add(i) else {
            return Err(ExceptionCode::IllegalDataAddress);
        };
        if let Some(r) = registers.get(&reg_addr) {
            response_values[i as usize] = *r;
        } else {
            debug!("can't handle read of register {reg_addr}/0x{reg_addr:X}");
            return Err(ExceptionCode::IllegalDataAddress);
        }
    }
    trace!("register read for addr:{addr} count:{cnt} returns {response_values:?}");
    Ok(response_values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_modbus::server::Service;
    use tokio_test::block_on;

    fn accessory() -> (InverterAccessory, AccessoryHandle) {
        InverterAccessory::new(&AccessoryInfo::new("Solarman Inverter", "2109876543"))
    }

    #[test]
    fn test_initial_readout() {
        let (accessory, _handle) = accessory();
        let readout = accessory.readout();

        assert_eq!(readout.temperature, 0.0);
        assert_eq!(readout.charging_state, Some(ChargingState::NotCharging));
        assert_eq!(readout.battery_level, 0);
        assert_eq!(readout.light_level, 0.0);
        assert_eq!(readout.light_max, 100_000.0);
    }

    #[test]
    fn test_published_values_are_visible() {
        let (accessory, mut handle) = accessory();
        handle.set_temperature(21.5).unwrap();
        handle.set_charging_state(ChargingState::Charging).unwrap();
        handle.set_battery_level(50).unwrap();
        handle.set_light_max(1000.0).unwrap();
        handle.set_light_level(500.0).unwrap();

        let readout = accessory.readout();
        assert_eq!(readout.temperature, 21.5);
        assert_eq!(readout.charging_state, Some(ChargingState::Charging));
        assert_eq!(readout.battery_level, 50);
        assert_eq!(readout.light_level, 500.0);
        assert_eq!(readout.light_max, 1000.0);
    }

    #[test]
    fn test_out_of_range_values() {
        let (accessory, mut handle) = accessory();

        assert!(matches!(
            handle.set_battery_level(101),
            Err(PublishError::OutOfRange { .. })
        ));
        assert_eq!(
            handle.set_temperature(f64::NAN),
            Err(PublishError::NotFinite {
                characteristic: "temperature"
            })
        );
        assert!(handle.set_light_max(-1.0).is_err());

        // Nothing changed
        assert_eq!(accessory.readout().battery_level, 0);
        assert_eq!(accessory.readout().light_max, 100_000.0);
    }

    #[test]
    fn test_float_characteristics_clamp() {
        let (accessory, mut handle) = accessory();
        handle.set_temperature(140.0).unwrap();
        handle.set_light_max(1000.0).unwrap();
        handle.set_light_level(1500.0).unwrap();
        assert_eq!(accessory.readout().temperature, 100.0);
        assert_eq!(accessory.readout().light_level, 1000.0);

        handle.set_light_level(-20.0).unwrap();
        assert_eq!(accessory.readout().light_level, 0.0);
    }

    #[test]
    fn test_identity_registers() {
        let (accessory, _handle) = accessory();
        let name = block_on(accessory.call(Request::ReadHoldingRegisters(
            registers::NAME,
            registers::NAME_LEN,
        )))
        .unwrap();
        let serial = block_on(accessory.call(Request::ReadInputRegisters(
            registers::SERIAL_NUMBER,
            registers::SERIAL_NUMBER_LEN,
        )))
        .unwrap();

        match (name, serial) {
            (Response::ReadHoldingRegisters(name), Response::ReadInputRegisters(serial)) => {
                assert_eq!(decode_string(&name), "Solarman Inverter");
                assert_eq!(decode_string(&serial), "2109876543");
            }
            other => panic!("unexpected responses {other:?}"),
        }
    }

    #[test]
    fn test_long_names_are_truncated() {
        let mut regs = HashMap::new();
        write_string(&mut regs, 0, 2, "Inverter°");
        let words: Vec<u16> = (0..2).map(|i| regs[&i]).collect();
        assert_eq!(decode_string(&words), "Inve");

        write_string(&mut regs, 0, 2, "°C");
        let words: Vec<u16> = (0..2).map(|i| regs[&i]).collect();
        assert_eq!(decode_string(&words), "?C");
    }

    #[test]
    fn test_controller_writes_are_rejected() {
        let (accessory, _handle) = accessory();
        let request = Request::WriteSingleRegister(registers::BATTERY_LEVEL, 99);
        let res = block_on(accessory.call(request));
        assert_eq!(res, Err(ExceptionCode::IllegalFunction));
        assert_eq!(accessory.readout().battery_level, 0);
    }

    #[test]
    fn test_unmapped_register_read() {
        let (accessory, _handle) = accessory();
        let res = block_on(accessory.call(Request::ReadHoldingRegisters(registers::LIGHT_MAX, 3)));
        assert_eq!(res, Err(ExceptionCode::IllegalDataAddress));

        let res = block_on(accessory.call(Request::ReadHoldingRegisters(u16::MAX, 2)));
        assert_eq!(res, Err(ExceptionCode::IllegalDataAddress));
    }
}
