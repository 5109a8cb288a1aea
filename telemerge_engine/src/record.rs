//! Inbound and outbound record shapes.
//!
//! A data record looks like
//!
//! ```text
//! { "num_of_data": 1,
//!   "data": { "id": "V1", "speed": { "value": 12, "received_at": 100 } },
//!   "produced_at": 120 }
//! ```
//!
//! where `id` may sit anywhere among the sensor fields. [`DeviceData`] owns
//! that flattening. Outbound records reuse the same object shape, either one
//! device per record ([`Payload`]) or several ([`PayloadBatch`]), wrapped in
//! an [`OutputRecord`] that carries routing metadata.

use std::{collections::BTreeMap, fmt};

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{MapAccess, Visitor},
    ser::SerializeMap,
};

use crate::slot::{MetricSlot, SensorMap};

/// Name of the field carrying the device identifier inside `data`.
pub const ID_FIELD: &str = "id";
/// Metadata key carrying the routing key of an [`OutputRecord`].
pub const ROUTING_KEY: &str = "routing_key";
/// Metadata key carrying the window start of a windowed [`OutputRecord`].
pub const WINDOW_START: &str = "window_start";

/// Errors produced while interpreting an inbound record body.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The body is not valid JSON or does not have the data record shape.
    #[error("malformed record body: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The body is valid JSON but not an object.
    #[error("record body is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, Default, PartialEq)]
/// One device's identifier and sensor readings.
pub struct DeviceData {
    /// The device identifier. Empty when the record carried none.
    pub id: String,
    /// The device's sensor readings.
    pub sensors: SensorMap,
}

impl DeviceData {
    /// Create a new [`DeviceData`].
    #[must_use]
    pub fn new(id: impl Into<String>, sensors: SensorMap) -> Self {
        Self {
            id: id.into(),
            sensors,
        }
    }
}

impl Serialize for DeviceData {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let with_id = usize::from(!self.id.is_empty());
        let mut map = serializer.serialize_map(Some(self.sensors.len() + with_id))?;
        if with_id == 1 {
            map.serialize_entry(ID_FIELD, &self.id)?;
        }
        // Sorted so that identical state serializes to identical bytes.
        let sorted: BTreeMap<&String, &MetricSlot> = self.sensors.iter().collect();
        for (sensor, slot) in sorted {
            map.serialize_entry(sensor, slot)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DeviceData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DeviceDataVisitor;

        impl<'de> Visitor<'de> for DeviceDataVisitor {
            type Value = DeviceData;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an object of an `id` and sensor readings")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut data = DeviceData::default();
                while let Some(key) = access.next_key::<String>()? {
                    if key == ID_FIELD {
                        data.id = access.next_value()?;
                    } else {
                        let slot: MetricSlot = access.next_value()?;
                        data.sensors.insert(key, slot);
                    }
                }
                Ok(data)
            }
        }

        deserializer.deserialize_map(DeviceDataVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// A record carrying exactly one device.
pub struct Payload {
    /// Number of devices carried, always 1 for records this crate builds.
    /// Inbound values are carried, not checked.
    #[serde(default)]
    pub num_of_data: i64,
    /// The device.
    #[serde(default)]
    pub data: DeviceData,
    /// Epoch milliseconds at which the record was produced.
    #[serde(default)]
    pub produced_at: i64,
}

impl Payload {
    /// Create a [`Payload`] for a single device.
    #[must_use]
    pub fn single(data: DeviceData, produced_at: i64) -> Self {
        Self {
            num_of_data: 1,
            data,
            produced_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// A record carrying several devices.
pub struct PayloadBatch {
    /// Number of devices carried, equal to `data.len()`.
    pub num_of_data: i64,
    /// The devices.
    pub data: Vec<DeviceData>,
    /// Epoch milliseconds at which the record was produced.
    pub produced_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
/// The body of an [`OutputRecord`].
pub enum Body {
    /// One device.
    Single(Payload),
    /// Several devices.
    Batch(PayloadBatch),
}

impl Body {
    /// Number of devices carried by this body.
    #[must_use]
    pub fn device_count(&self) -> usize {
        match self {
            Body::Single(_) => 1,
            Body::Batch(batch) => batch.data.len(),
        }
    }

    /// The `produced_at` of this body.
    #[must_use]
    pub fn produced_at(&self) -> i64 {
        match self {
            Body::Single(payload) => payload.produced_at,
            Body::Batch(batch) => batch.produced_at,
        }
    }

    /// Iterate over the devices carried by this body.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceData> {
        let (single, batch) = match self {
            Body::Single(payload) => (Some(&payload.data), None),
            Body::Batch(batch) => (None, Some(batch.data.iter())),
        };
        single.into_iter().chain(batch.into_iter().flatten())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
/// A record emitted downstream by a flush.
pub struct OutputRecord {
    /// Routing and labeling metadata, see [`ROUTING_KEY`] and [`WINDOW_START`].
    pub metadata: BTreeMap<String, String>,
    /// The record body.
    pub payload: Body,
}

impl OutputRecord {
    /// A single-device record, routed by the device id.
    #[must_use]
    pub fn device(id: impl Into<String>, sensors: SensorMap, produced_at: i64) -> Self {
        Self::from_payload(Payload::single(DeviceData::new(id, sensors), produced_at))
    }

    /// A single-device record built from an existing [`Payload`], routed by
    /// the payload's device id.
    #[must_use]
    pub fn from_payload(payload: Payload) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(ROUTING_KEY.to_string(), payload.data.id.clone());
        Self {
            metadata,
            payload: Body::Single(payload),
        }
    }

    /// A multi-device record. Carries no routing key.
    #[must_use]
    pub fn batch(data: Vec<DeviceData>, produced_at: i64) -> Self {
        Self {
            metadata: BTreeMap::new(),
            payload: Body::Batch(PayloadBatch {
                num_of_data: i64::try_from(data.len()).unwrap_or(i64::MAX),
                data,
                produced_at,
            }),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The routing key, if any.
    #[must_use]
    pub fn routing_key(&self) -> Option<&str> {
        self.metadata.get(ROUTING_KEY).map(String::as_str)
    }
}
