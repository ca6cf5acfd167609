//! Field-bus protocol vocabulary: function codes, register data types and the
//! conversion of raw register words into readings.
use crate::Error;
use serde_json::Value;

/// Holding register reads are stored divided by this factor.
pub const HOLDING_REGISTER_SCALE: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadDiscreteInputs = 2,
    ReadHoldingRegisters = 3,
    ReadInputRegisters = 4,
    WriteSingleCoil = 5,
    WriteSingleRegister = 6,
    WriteMultipleCoils = 15,
    WriteMultipleRegisters = 16,
}

impl FunctionCode {
    pub fn is_read(&self) -> bool {
        (*self as u8) <= 4
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ReadCoils),
            2 => Ok(Self::ReadDiscreteInputs),
            3 => Ok(Self::ReadHoldingRegisters),
            4 => Ok(Self::ReadInputRegisters),
            5 => Ok(Self::WriteSingleCoil),
            6 => Ok(Self::WriteSingleRegister),
            15 => Ok(Self::WriteMultipleCoils),
            16 => Ok(Self::WriteMultipleRegisters),
            _ => Err(Error::UnsupportedOperation(value)),
        }
    }
}

/// Register data width and interpretation, by configuration code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DataType {
    Bit = 1,
    Int16 = 4,
    #[default]
    UInt16 = 5,
    Int32 = 6,
    UInt32 = 7,
    Float32 = 8,
}

impl DataType {
    /// Number of 16 bit registers read for one value.
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::Bit | DataType::Int16 | DataType::UInt16 => 1,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 2,
        }
    }

    /// Decodes raw register words, high word first for wide types.
    pub fn decode(&self, words: &[u16]) -> Result<f64, Error> {
        if words.len() < self.register_count() as usize {
            return Err(Error::Protocol(format!(
                "Expected {} registers for {self:?}, got {}",
                self.register_count(),
                words.len()
            )));
        }
        let wide = || ((words[0] as u32) << 16) | words[1] as u32;
        Ok(match self {
            DataType::Bit => (words[0] & 0x0001) as f64,
            DataType::Int16 => words[0] as i16 as f64,
            DataType::UInt16 => words[0] as f64,
            DataType::Int32 => wide() as i32 as f64,
            DataType::UInt32 => wide() as f64,
            DataType::Float32 => f32::from_bits(wide()) as f64,
        })
    }
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Bit),
            4 => Ok(Self::Int16),
            5 => Ok(Self::UInt16),
            6 => Ok(Self::Int32),
            7 => Ok(Self::UInt32),
            8 => Ok(Self::Float32),
            _ => Err(Error::Protocol(format!("Unknown data type {value}"))),
        }
    }
}

/// Converts a register read into the reading stored for a point.
pub fn register_reading(
    code: FunctionCode,
    data_type: DataType,
    words: &[u16],
) -> Result<Value, Error> {
    let value = data_type.decode(words)?;
    let value = match code {
        FunctionCode::ReadHoldingRegisters => value / HOLDING_REGISTER_SCALE,
        _ => value,
    };
    Ok(number(value))
}

fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Interprets a JSON value as a coil state, non-zero numbers mean on.
pub fn coil_value(value: &Value) -> Result<bool, Error> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        Value::String(s) => match s.trim() {
            "1" | "true" | "on" => Ok(true),
            "0" | "false" | "off" => Ok(false),
            _ => Err(Error::Protocol(format!("Invalid coil value '{s}'"))),
        },
        _ => Err(Error::Protocol(format!("Invalid coil value {value}"))),
    }
}

/// Interprets a JSON value as one 16 bit register word.
pub fn register_value(value: &Value) -> Result<u16, Error> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(*b as u8 as f64),
        _ => None,
    };
    match number {
        Some(v) if (0.0..=u16::MAX as f64).contains(&v) => Ok(v as u16),
        Some(v) if (i16::MIN as f64..0.0).contains(&v) => Ok(v as i16 as u16),
        _ => Err(Error::Protocol(format!("Invalid register value {value}"))),
    }
}

/// Applies `single` to every element of an array, or to a lone value.
pub fn value_list<T>(
    value: &Value,
    single: impl Fn(&Value) -> Result<T, Error>,
) -> Result<Vec<T>, Error> {
    match value {
        Value::Array(items) => items.iter().map(single).collect(),
        other => Ok(vec![single(other)?]),
    }
}
