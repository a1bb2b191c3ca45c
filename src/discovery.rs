//! Deterministic, stateless home-automation discovery payload templating.

use serde::Serialize;
use serde_json::json;

use crate::config::DeviceInfo;

#[derive(Serialize)]
struct Device<'a> {
    name: &'a str,
    manufacturer: &'a str,
    model: &'a str,
    identifiers: &'a [String],
}

fn device_block(dev: &DeviceInfo) -> Device<'_> {
    Device {
        name: &dev.name,
        manufacturer: &dev.manufacturer,
        model: &dev.model,
        identifiers: &dev.identifiers,
    }
}

pub fn binary_sensor_config(
    discovery_prefix: &str,
    base_topic: &str,
    dev: &DeviceInfo,
    pin: u16,
) -> (String, String) {
    let topic = format!("{discovery_prefix}/binary_sensor/{}/S{pin}/config", dev.name);
    let payload = json!({
        "name": format!("S{pin}"),
        "unique_id": format!("{}_s_{pin}", dev.name),
        "state_topic": format!("{base_topic}/S{pin}/state"),
        "availability_topic": format!("{base_topic}/availability"),
        "payload_on": "ON",
        "payload_off": "OFF",
        "device": device_block(dev),
        "icon": "mdi:toggle-switch",
    });
    (topic, payload.to_string())
}

pub fn switch_config(
    discovery_prefix: &str,
    base_topic: &str,
    dev: &DeviceInfo,
    pin: u16,
) -> (String, String) {
    let topic = format!("{discovery_prefix}/switch/{}/P{pin}/config", dev.name);
    let payload = json!({
        "name": format!("P{pin}"),
        "unique_id": format!("{}_p_{pin}", dev.name),
        "state_topic": format!("{base_topic}/P{pin}/state"),
        "command_topic": format!("{base_topic}/P{pin}/set"),
        "availability_topic": format!("{base_topic}/availability"),
        "payload_on": "ON",
        "payload_off": "OFF",
        "icon": "mdi:electric-switch",
        "device": device_block(dev),
    });
    (topic, payload.to_string())
}

pub fn analog_sensor_config(
    discovery_prefix: &str,
    base_topic: &str,
    dev: &DeviceInfo,
    ch: u16,
) -> (String, String) {
    let topic = format!("{discovery_prefix}/sensor/{}/A{ch}/config", dev.name);
    let payload = json!({
        "name": format!("A{ch}"),
        "unique_id": format!("{}_a_{ch}", dev.name),
        "state_topic": format!("{base_topic}/A{ch}/state"),
        "availability_topic": format!("{base_topic}/availability"),
        "state_class": "measurement",
        "icon": "mdi:waveform",
        "device": device_block(dev),
    });
    (topic, payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> DeviceInfo {
        DeviceInfo {
            name: "jarvis_arduino".to_string(),
            manufacturer: "Acme".to_string(),
            model: "JA01".to_string(),
            identifiers: vec!["abc123".to_string()],
        }
    }

    #[test]
    fn binary_sensor_topic_and_fields() {
        let (topic, payload) = binary_sensor_config("homeassistant", "home/jarvis_arduino", &dev(), 38);
        assert_eq!(topic, "homeassistant/binary_sensor/jarvis_arduino/S38/config");
        let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["state_topic"], "home/jarvis_arduino/S38/state");
        assert_eq!(v["availability_topic"], "home/jarvis_arduino/availability");
        assert_eq!(v["payload_on"], "ON");
        assert_eq!(v["payload_off"], "OFF");
    }

    #[test]
    fn switch_topic_and_fields() {
        let (topic, payload) = switch_config("homeassistant", "home/jarvis_arduino", &dev(), 13);
        assert_eq!(topic, "homeassistant/switch/jarvis_arduino/P13/config");
        let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["command_topic"], "home/jarvis_arduino/P13/set");
        assert_eq!(v["state_topic"], "home/jarvis_arduino/P13/state");
    }

    #[test]
    fn analog_sensor_topic_and_fields() {
        let (topic, payload) = analog_sensor_config("homeassistant", "home/jarvis_arduino", &dev(), 3);
        assert_eq!(topic, "homeassistant/sensor/jarvis_arduino/A3/config");
        let v: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["state_class"], "measurement");
    }
}
