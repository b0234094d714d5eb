/**
 * Device Call Example
 *
 * Connects to a miIO device, reads a few properties with `get_prop` and
 * toggles a Yeelight ceiling lamp through the capability traits.
 *
 * Usage: device_call <ip[:port]> [token-hex]
 * Without a token, the device must reveal it or have it in ./tokens.json.
 */
use rustmiio::capability::{Brightness, CtMoonLight, PowerControl};
use rustmiio::{CallOptions, Network, Token, TokenStore};
use serde_json::json;
use tokio::time::{Duration, sleep};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- rustmiio - Device Call ---");

    let mut args = std::env::args().skip(1);
    let Some(address) = args.next() else {
        eprintln!("usage: device_call <ip[:port]> [token-hex]");
        return;
    };
    let token = match args.next().map(|t| t.parse::<Token>()).transpose() {
        Ok(t) => t,
        Err(e) => {
            eprintln!("[ERROR] {}", e);
            return;
        }
    };

    // 1. Connect: handshake, then identify with miIO.info
    let network = match Network::new(Some(TokenStore::new("tokens.json"))) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("[ERROR] Could not open socket: {}", e);
            return;
        }
    };
    let device = match network.connect(&address, token).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("[ERROR] Connection failed: {} ({})", e, e.code());
            return;
        }
    };
    println!(
        "[SUCCESS] Connected to {:?} ({})",
        device.id(),
        device.model().unwrap_or_default()
    );

    // 2. Raw call
    println!("[STEP 1] Reading properties...");
    match device
        .call("get_prop", json!(["power", "bright"]), CallOptions::default())
        .await
    {
        Ok(values) => println!("[SUCCESS] power/bright: {}", values),
        Err(e) => eprintln!("[ERROR] get_prop failed: {}", e),
    }

    // 3. Capability traits
    println!("[STEP 2] Toggling lamp...");
    let mut lamp = CtMoonLight::new(device.clone());
    if let Err(e) = lamp.refresh().await {
        eprintln!("[ERROR] Refresh failed: {}", e);
    } else {
        let on = lamp.is_on();
        if let Err(e) = lamp.set_power(!on).await {
            eprintln!("[ERROR] set_power failed: {}", e);
        }
        sleep(Duration::from_secs(1)).await;
        if let Err(e) = lamp.set_power(on).await {
            eprintln!("[ERROR] set_power failed: {}", e);
        }
        println!("[INFO] Brightness: {:?}", lamp.brightness());
    }

    network.release(&device);
    network.shutdown();
    println!("[INFO] Example finished.");
}
