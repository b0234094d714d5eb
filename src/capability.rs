//! Device capabilities built on top of plain calls.
//! A device kind implements the subset of capability traits it supports,
//! backed by a property map refreshed with `get_prop`.

use crate::device::{CallOptions, Device};
use crate::error::{MiioError, Result};
use log::debug;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;

const EFFECT: &str = "sudden";

/// Power mode argument of `set_power` on Yeelight-style lamps.
const MODE_NORMAL: u8 = 0;
const MODE_CT: u8 = 1;
const MODE_NIGHT: u8 = 5;

/// Last known values of a fixed set of device properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    values: BTreeMap<String, Value>,
    order: Vec<String>,
}

impl Properties {
    /// Track `keys`, all unknown until the first refresh.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let order: Vec<String> = keys.into_iter().map(Into::into).collect();
        Self {
            values: order.iter().map(|k| (k.clone(), Value::Null)).collect(),
            order,
        }
    }

    pub fn keys(&self) -> &[String] {
        &self.order
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Numeric property; devices send numbers as strings more often than not.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        if let Some(slot) = self.values.get_mut(key) {
            *slot = value;
        }
    }

    /// Ask the device for every tracked property in one `get_prop` call.
    pub async fn refresh(&mut self, device: &Device) -> Result<()> {
        let result = device
            .call("get_prop", json!(self.order), CallOptions::default())
            .await?;
        let values = match result {
            Value::Array(values) => values,
            other => {
                return Err(MiioError::Json(format!(
                    "get_prop returned {} instead of an array",
                    other
                )));
            }
        };
        for (key, value) in self.order.iter().zip(values) {
            self.values.insert(key.clone(), value);
        }
        debug!("Properties of {}: {:?}", device.address(), self.values);
        Ok(())
    }
}

pub trait PowerControl {
    fn is_on(&self) -> bool;
    fn set_power(&mut self, on: bool) -> impl Future<Output = Result<()>> + Send;
}

/// Brightness in percent, `1..=100`.
pub trait Brightness {
    fn brightness(&self) -> Option<u8>;
    fn set_brightness(&mut self, percent: u8) -> impl Future<Output = Result<()>> + Send;
}

/// White color temperature in Kelvin.
pub trait ColorTemperature {
    fn color_temperature(&self) -> Option<u32>;
    fn set_color_temperature(&mut self, kelvin: u32) -> impl Future<Output = Result<()>> + Send;
}

pub trait HueSaturation {
    fn hue(&self) -> Option<u16>;
    fn saturation(&self) -> Option<u8>;
    fn set_hue_saturation(
        &mut self,
        hue: u16,
        saturation: u8,
    ) -> impl Future<Output = Result<()>> + Send;
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

fn clamp_percent(value: u8) -> u8 {
    value.clamp(1, 100)
}

/// Ceiling lamp with white and moonlight (night) modes.
pub struct CtMoonLight {
    device: Device,
    properties: Properties,
    night_mode: bool,
    min_kelvin: u32,
    max_kelvin: u32,
}

impl CtMoonLight {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            properties: Properties::new(["power", "bright", "nl_br", "ct", "active_mode"]),
            night_mode: false,
            min_kelvin: 2700,
            max_kelvin: 6500,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn is_night_mode(&self) -> bool {
        self.night_mode
    }

    /// Re-read the lamp state, including whether moonlight is active.
    pub async fn refresh(&mut self) -> Result<()> {
        self.properties.refresh(&self.device).await?;
        self.night_mode = self.properties.get_u64("active_mode") == Some(1);
        Ok(())
    }

    /// Switch between moonlight and white light; applied right away when on.
    pub async fn set_night_mode(&mut self, night: bool) -> Result<()> {
        if self.night_mode == night {
            return Ok(());
        }
        self.night_mode = night;
        if self.is_on() {
            self.set_power(true).await?;
        }
        Ok(())
    }

    fn power_mode(&self) -> u8 {
        if self.night_mode { MODE_NIGHT } else { MODE_CT }
    }
}

impl PowerControl for CtMoonLight {
    fn is_on(&self) -> bool {
        self.properties.get_str("power") == Some("on")
    }

    async fn set_power(&mut self, on: bool) -> Result<()> {
        let params = json!([on_off(on), EFFECT, 0, self.power_mode()]);
        self.device
            .call("set_power", params, CallOptions::default())
            .await?;
        self.properties.set("power", json!(on_off(on)));
        self.properties
            .set("active_mode", json!(u8::from(on && self.night_mode)));
        Ok(())
    }
}

impl Brightness for CtMoonLight {
    fn brightness(&self) -> Option<u8> {
        let key = if self.night_mode { "nl_br" } else { "bright" };
        self.properties
            .get_u64(key)
            .and_then(|v| u8::try_from(v).ok())
    }

    async fn set_brightness(&mut self, percent: u8) -> Result<()> {
        let percent = clamp_percent(percent);
        self.device
            .call("set_bright", json!([percent, EFFECT, 0]), CallOptions::default())
            .await?;
        let key = if self.night_mode { "nl_br" } else { "bright" };
        self.properties.set(key, json!(percent.to_string()));
        Ok(())
    }
}

impl ColorTemperature for CtMoonLight {
    fn color_temperature(&self) -> Option<u32> {
        self.properties
            .get_u64("ct")
            .and_then(|v| u32::try_from(v).ok())
    }

    async fn set_color_temperature(&mut self, kelvin: u32) -> Result<()> {
        let kelvin = kelvin.clamp(self.min_kelvin, self.max_kelvin);
        self.device
            .call("set_ct_abx", json!([kelvin, EFFECT, 0]), CallOptions::default())
            .await?;
        self.properties.set("ct", json!(kelvin.to_string()));
        Ok(())
    }
}

/// Color bulb with white and HSV modes.
pub struct ColorLight {
    device: Device,
    properties: Properties,
}

impl ColorLight {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            properties: Properties::new(["power", "bright", "ct", "hue", "sat", "color_mode"]),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub async fn refresh(&mut self) -> Result<()> {
        self.properties.refresh(&self.device).await
    }
}

impl PowerControl for ColorLight {
    fn is_on(&self) -> bool {
        self.properties.get_str("power") == Some("on")
    }

    async fn set_power(&mut self, on: bool) -> Result<()> {
        let params = json!([on_off(on), EFFECT, 0, MODE_NORMAL]);
        self.device
            .call("set_power", params, CallOptions::default())
            .await?;
        self.properties.set("power", json!(on_off(on)));
        Ok(())
    }
}

impl Brightness for ColorLight {
    fn brightness(&self) -> Option<u8> {
        self.properties
            .get_u64("bright")
            .and_then(|v| u8::try_from(v).ok())
    }

    async fn set_brightness(&mut self, percent: u8) -> Result<()> {
        let percent = clamp_percent(percent);
        self.device
            .call("set_bright", json!([percent, EFFECT, 0]), CallOptions::default())
            .await?;
        self.properties.set("bright", json!(percent.to_string()));
        Ok(())
    }
}

impl ColorTemperature for ColorLight {
    fn color_temperature(&self) -> Option<u32> {
        self.properties
            .get_u64("ct")
            .and_then(|v| u32::try_from(v).ok())
    }

    async fn set_color_temperature(&mut self, kelvin: u32) -> Result<()> {
        let kelvin = kelvin.clamp(1700, 6500);
        self.device
            .call("set_ct_abx", json!([kelvin, EFFECT, 0]), CallOptions::default())
            .await?;
        self.properties.set("ct", json!(kelvin.to_string()));
        self.properties.set("color_mode", json!("2"));
        Ok(())
    }
}

impl HueSaturation for ColorLight {
    fn hue(&self) -> Option<u16> {
        self.properties
            .get_u64("hue")
            .and_then(|v| u16::try_from(v).ok())
    }

    fn saturation(&self) -> Option<u8> {
        self.properties
            .get_u64("sat")
            .and_then(|v| u8::try_from(v).ok())
    }

    async fn set_hue_saturation(&mut self, hue: u16, saturation: u8) -> Result<()> {
        let hue = hue.min(359);
        let saturation = saturation.min(100);
        self.device
            .call(
                "set_hsv",
                json!([hue, saturation, EFFECT, 0]),
                CallOptions::default(),
            )
            .await?;
        self.properties.set("hue", json!(hue.to_string()));
        self.properties.set("sat", json!(saturation.to_string()));
        self.properties.set("color_mode", json!("3"));
        Ok(())
    }
}
