//! Capability traits driving lamps through an in-memory device.

mod common;

use common::*;
use rustmiio::capability::{
    Brightness, ColorLight, ColorTemperature, CtMoonLight, HueSaturation, PowerControl, Properties,
};
use rustmiio::MiioError;
use serde_json::{Value, json};
use std::sync::Arc;

#[tokio::test]
async fn properties_refresh_in_key_order() {
    let transport = MockTransport::new(MockDevice {
        responder: answer(json!(["on", "80", 4000])),
        ..Default::default()
    });
    let device = transport.session(builder().token(token()));

    let mut props = Properties::new(["power", "bright", "ct"]);
    props.refresh(&device).await.unwrap();
    assert_eq!(props.get_str("power"), Some("on"));
    assert_eq!(props.get_u64("bright"), Some(80));
    assert_eq!(props.get_u64("ct"), Some(4000));
    assert_eq!(transport.requests()[0]["params"], json!(["power", "bright", "ct"]));
}

#[tokio::test]
async fn refresh_rejects_non_array_result() {
    let transport = MockTransport::new(MockDevice {
        responder: answer(json!("ok")),
        ..Default::default()
    });
    let device = transport.session(builder().token(token()));

    let mut props = Properties::new(["power"]);
    assert!(matches!(props.refresh(&device).await, Err(MiioError::Json(_))));
}

#[tokio::test]
async fn moon_light_power_follows_night_mode() {
    let transport = MockTransport::new(MockDevice {
        responder: Arc::new(|req: &Value| {
            let result = match req["method"].as_str() {
                Some("get_prop") => json!(["on", "50", "10", "3000", "0"]),
                _ => json!(["ok"]),
            };
            Some(json!({"id": req["id"], "result": result}))
        }),
        ..Default::default()
    });
    let device = transport.session(builder().token(token()));
    let mut lamp = CtMoonLight::new(device);

    lamp.refresh().await.unwrap();
    assert!(lamp.is_on());
    assert!(!lamp.is_night_mode());
    assert_eq!(lamp.brightness(), Some(50));
    assert_eq!(lamp.color_temperature(), Some(3000));

    lamp.set_night_mode(true).await.unwrap();
    assert_eq!(lamp.brightness(), Some(10));
    lamp.set_brightness(0).await.unwrap();
    lamp.set_color_temperature(9000).await.unwrap();

    let requests = transport.requests();
    let calls: Vec<(&str, &Value)> = requests
        .iter()
        .map(|r| (r["method"].as_str().unwrap(), &r["params"]))
        .collect();
    assert_eq!(
        calls[1..],
        [
            ("set_power", &json!(["on", "sudden", 0, 5])),
            ("set_bright", &json!([1, "sudden", 0])),
            ("set_ct_abx", &json!([6500, "sudden", 0])),
        ]
    );
    assert_eq!(lamp.brightness(), Some(1));
}

#[tokio::test]
async fn night_mode_switch_while_off_sends_nothing() {
    let transport = MockTransport::new(MockDevice {
        responder: answer(json!(["ok"])),
        ..Default::default()
    });
    let device = transport.session(builder().token(token()));
    let mut lamp = CtMoonLight::new(device);

    lamp.set_night_mode(true).await.unwrap();
    assert!(transport.requests().is_empty());

    lamp.set_power(true).await.unwrap();
    assert_eq!(transport.requests()[0]["params"], json!(["on", "sudden", 0, 5]));
    assert!(lamp.is_on());
}

#[tokio::test]
async fn color_light_sets_hsv() {
    let transport = MockTransport::new(MockDevice {
        responder: answer(json!(["ok"])),
        ..Default::default()
    });
    let device = transport.session(builder().token(token()));
    let mut bulb = ColorLight::new(device);

    bulb.set_power(true).await.unwrap();
    bulb.set_hue_saturation(400, 120).await.unwrap();
    assert_eq!(bulb.hue(), Some(359));
    assert_eq!(bulb.saturation(), Some(100));

    let requests = transport.requests();
    assert_eq!(requests[0]["params"], json!(["on", "sudden", 0, 0]));
    assert_eq!(requests[1]["method"], "set_hsv");
    assert_eq!(requests[1]["params"], json!([359, 100, "sudden", 0]));
}

#[tokio::test]
async fn failed_command_keeps_cached_state() {
    let transport = MockTransport::new(MockDevice {
        responder: Arc::new(|req: &Value| {
            Some(json!({"id": req["id"], "error": {"code": -5001, "message": "invalid_arg"}}))
        }),
        ..Default::default()
    });
    let device = transport.session(builder().token(token()));
    let mut bulb = ColorLight::new(device);

    let err = bulb.set_brightness(40).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid argument");
    assert_eq!(bulb.brightness(), None);
}
