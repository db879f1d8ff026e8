use std::collections::HashMap;

/// Inverter internal temperature, degrees C
pub const TEMPERATURE_KEY: &str = "T_AC_RDT1";
/// Total AC output power
pub const OUTPUT_POWER_KEY: &str = "APo_t1";
/// Rated power of the inverter
pub const RATED_POWER_KEY: &str = "Pr1";

/// One poll worth of raw readings, keyed by the provider's data key.
/// Values are kept as the provider sent them and only parsed on lookup.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReadingSnapshot {
    readings: HashMap<String, String>,
}

impl ReadingSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Raw string value for `key`, if the provider sent one
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.readings.get(key).map(String::as_str)
    }

    /// Numeric value for `key`.
    /// Returns `None` when the key is absent or its value is not a finite number.
    pub fn reading(&self, key: &str) -> Option<f64> {
        self.raw(key)?
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
    }

    /// Numeric value for `key`, with missing or unparsable readings treated as 0
    pub fn value_or_zero(&self, key: &str) -> f64 {
        self.reading(key).unwrap_or_default()
    }
}

impl<K, V> FromIterator<(K, V)> for ReadingSnapshot
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            readings: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingState {
    NotCharging,
    Charging,
}

impl ChargingState {
    /// Characteristic encoding used on the accessory
    pub fn as_u16(self) -> u16 {
        match self {
            ChargingState::NotCharging => 0,
            ChargingState::Charging => 1,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(ChargingState::NotCharging),
            1 => Some(ChargingState::Charging),
            _ => None,
        }
    }
}

/// Metrics published to the accessory for one poll cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedMetrics {
    pub temperature_c: f64,
    pub output_power: f64,
    pub rated_power: f64,
    pub battery_level_pct: u8,
    pub charging_state: ChargingState,
    pub light_level: f64,
    pub light_max: f64,
}

/// Maps a reading snapshot into accessory metrics.
///
/// Never fails: any reading that is missing or unparsable counts as 0.
/// The battery characteristic reports output power as a percentage of rated
/// power, and the light sensor reports output power against the rated ceiling.
pub fn map(snapshot: &ReadingSnapshot) -> DerivedMetrics {
    let temperature_c = snapshot.value_or_zero(TEMPERATURE_KEY);
    let output_power = snapshot.value_or_zero(OUTPUT_POWER_KEY);
    let rated_power = snapshot.value_or_zero(RATED_POWER_KEY);

    let charging_state = if output_power > 0.0 {
        ChargingState::Charging
    } else {
        ChargingState::NotCharging
    };

    DerivedMetrics {
        temperature_c,
        output_power,
        rated_power,
        battery_level_pct: battery_level_pct(output_power, rated_power),
        charging_state,
        light_level: output_power,
        light_max: rated_power,
    }
}

/// Output as a whole percentage of rated power, clamped to 0..=100.
/// A zero rating yields 0.
fn battery_level_pct(output_power: f64, rated_power: f64) -> u8 {
    if rated_power == 0.0 {
        return 0;
    }
    let pct = (output_power * 100.0 / rated_power).floor();
    if pct.is_nan() {
        return 0;
    }
    pct.clamp(0.0, 100.0) as u8
}
