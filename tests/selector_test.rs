//! Battery-source selection against a hand-populated mirror

use serde_json::{Value, json};
use std::collections::HashMap;
use systemcalc::Config;
use systemcalc::engine::SystemCalc;
use systemcalc::monitor::MonitorEvent;

fn engine() -> SystemCalc {
    let mut config = Config::default();
    config.relay_gpio_file = "/nonexistent/gpio/value".to_string();
    SystemCalc::new(config).unwrap()
}

async fn add_service(
    calc: &mut SystemCalc,
    service: &str,
    instance: u32,
    values: &[(&str, Value)],
) {
    let values: HashMap<String, Value> = values
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect();
    calc.handle_event(MonitorEvent::ServiceAdded {
        service: service.to_string(),
        instance,
        values,
    })
    .await;
}

async fn remove_service(calc: &mut SystemCalc, service: &str) {
    calc.handle_event(MonitorEvent::ServiceRemoved {
        service: service.to_string(),
    })
    .await;
}

async fn add_battery(calc: &mut SystemCalc, service: &str, instance: u32) {
    add_service(
        calc,
        service,
        instance,
        &[
            ("/Connected", json!(1)),
            ("/ProductName", json!("BMV-700")),
            ("/Mgmt/Connection", json!("VE.Direct")),
            ("/Soc", json!(50.0)),
        ],
    )
    .await;
}

async fn add_vebus(calc: &mut SystemCalc) -> &'static str {
    let service = "com.victronenergy.vebus.ttyO1";
    add_service(
        calc,
        service,
        261,
        &[
            ("/ProductName", json!("Multi")),
            ("/Mgmt/Connection", json!("CCGX-VE.Bus port")),
            ("/State", json!(3)),
            ("/Soc", json!(53.2)),
        ],
    )
    .await;
    service
}

async fn add_settings_with_battery_service(calc: &mut SystemCalc, value: Value) {
    add_service(
        calc,
        "com.victronenergy.settings",
        0,
        &[("/Settings/SystemSetup/BatteryService", value)],
    )
    .await;
}

async fn set_battery_setting(calc: &mut SystemCalc, value: Value) {
    calc.handle_event(MonitorEvent::ValueChanged {
        service: "com.victronenergy.settings".to_string(),
        path: "/Settings/SystemSetup/BatteryService".to_string(),
        value,
    })
    .await;
}

#[tokio::test]
async fn auto_picks_smallest_battery_name() {
    let mut calc = engine();
    add_battery(&mut calc, "com.victronenergy.battery.ttyO9", 9).await;
    add_battery(&mut calc, "com.victronenergy.battery.ttyO2", 2).await;
    add_vebus(&mut calc).await;

    assert_eq!(calc.published("/ActiveBatteryService"), json!("battery/2"));
    assert_eq!(
        calc.published("/AutoSelectedBatteryService"),
        json!("BMV-700 on VE.Direct")
    );
    assert_eq!(
        calc.published("/AutoSelectedBatteryMeasurement"),
        json!("com_victronenergy_battery_2/Dc/0")
    );
}

#[tokio::test]
async fn solar_charger_blocks_vebus_fallback() {
    // DC sources without a battery monitor: refuse to guess an SoC source
    let mut calc = engine();
    add_service(
        &mut calc,
        "com.victronenergy.solarcharger.ttyO1",
        0,
        &[
            ("/Connected", json!(1)),
            ("/ProductName", json!("BlueSolar")),
            ("/Mgmt/Connection", json!("VE.Direct")),
        ],
    )
    .await;
    add_vebus(&mut calc).await;

    assert_eq!(calc.published("/ActiveBatteryService"), Value::Null);
    assert_eq!(
        calc.published("/AutoSelectedBatteryService"),
        json!("No battery monitor found")
    );
}

#[tokio::test]
async fn lone_vebus_is_auto_selected() {
    let mut calc = engine();
    add_vebus(&mut calc).await;
    assert_eq!(calc.published("/ActiveBatteryService"), json!("vebus/261"));
    assert_eq!(
        calc.published("/AutoSelectedBatteryService"),
        json!("Multi on CCGX-VE.Bus port")
    );
}

#[tokio::test]
async fn nobattery_selects_nothing() {
    let mut calc = engine();
    add_battery(&mut calc, "com.victronenergy.battery.ttyO2", 2).await;
    add_settings_with_battery_service(&mut calc, json!("nobattery")).await;

    assert_eq!(calc.published("/ActiveBatteryService"), Value::Null);
    assert_eq!(calc.published("/AutoSelectedBatteryService"), Value::Null);
}

#[tokio::test]
async fn pinned_service_resolves_by_instance() {
    let mut calc = engine();
    add_battery(&mut calc, "com.victronenergy.battery.ttyO2", 2).await;
    add_battery(&mut calc, "com.victronenergy.battery.ttyO9", 9).await;
    add_settings_with_battery_service(&mut calc, json!("battery/9")).await;

    assert_eq!(calc.published("/ActiveBatteryService"), json!("battery/9"));
    // User-pinned: no auto label
    assert_eq!(calc.published("/AutoSelectedBatteryService"), Value::Null);
}

#[tokio::test]
async fn pinned_service_absent_selects_nothing() {
    // A chosen monitor that is gone may come back; do not fall back
    let mut calc = engine();
    add_battery(&mut calc, "com.victronenergy.battery.ttyO2", 2).await;
    add_settings_with_battery_service(&mut calc, json!("battery/7")).await;

    assert_eq!(calc.published("/ActiveBatteryService"), Value::Null);
}

#[tokio::test]
async fn invalid_setting_behaves_as_default() {
    let mut calc = engine();
    add_battery(&mut calc, "com.victronenergy.battery.ttyO2", 2).await;
    add_settings_with_battery_service(&mut calc, json!("garbage")).await;

    assert_eq!(calc.published("/ActiveBatteryService"), json!("battery/2"));
}

#[tokio::test]
async fn selection_follows_setting_changes() {
    let mut calc = engine();
    add_battery(&mut calc, "com.victronenergy.battery.ttyO2", 2).await;
    add_settings_with_battery_service(&mut calc, json!("default")).await;
    assert_eq!(calc.published("/ActiveBatteryService"), json!("battery/2"));

    set_battery_setting(&mut calc, json!("nobattery")).await;
    assert_eq!(calc.published("/ActiveBatteryService"), Value::Null);

    set_battery_setting(&mut calc, json!("default")).await;
    assert_eq!(calc.published("/ActiveBatteryService"), json!("battery/2"));
}

#[tokio::test]
async fn selection_follows_service_removal() {
    let mut calc = engine();
    add_battery(&mut calc, "com.victronenergy.battery.ttyO2", 2).await;
    add_battery(&mut calc, "com.victronenergy.battery.ttyO9", 9).await;
    assert_eq!(calc.published("/ActiveBatteryService"), json!("battery/2"));

    remove_service(&mut calc, "com.victronenergy.battery.ttyO2").await;
    assert_eq!(calc.published("/ActiveBatteryService"), json!("battery/9"));
}

#[tokio::test]
async fn available_services_lists_sentinels_and_sources() {
    let mut calc = engine();
    add_battery(&mut calc, "com.victronenergy.battery.ttyO2", 2).await;
    add_vebus(&mut calc).await;

    let raw = calc.published("/AvailableBatteryServices");
    let parsed: Value = serde_json::from_str(raw.as_str().unwrap()).unwrap();
    assert_eq!(parsed["default"], json!("Automatic"));
    assert_eq!(parsed["nobattery"], json!("No battery monitor"));
    assert_eq!(parsed["battery/2"], json!("BMV-700 on VE.Direct"));
    assert_eq!(parsed["vebus/261"], json!("Multi on CCGX-VE.Bus port"));

    let measurements = calc.published("/AvailableBatteryMeasurements");
    assert_eq!(
        measurements["com_victronenergy_battery_2/Dc/0"],
        json!("BMV-700 on VE.Direct")
    );
    assert_eq!(measurements["default"], json!("Automatic"));
}

#[tokio::test]
async fn disconnected_services_are_not_selectable() {
    let mut calc = engine();
    add_service(
        &mut calc,
        "com.victronenergy.battery.ttyO2",
        2,
        &[
            ("/Connected", json!(0)),
            ("/ProductName", json!("BMV-700")),
            ("/Mgmt/Connection", json!("VE.Direct")),
        ],
    )
    .await;
    assert_eq!(calc.published("/ActiveBatteryService"), Value::Null);

    let raw = calc.published("/AvailableBatteryServices");
    let parsed: Value = serde_json::from_str(raw.as_str().unwrap()).unwrap();
    assert!(parsed.get("battery/2").is_none());

    // It connects: now it is both selectable and auto-selected
    calc.handle_event(MonitorEvent::ValueChanged {
        service: "com.victronenergy.battery.ttyO2".to_string(),
        path: "/Connected".to_string(),
        value: json!(1),
    })
    .await;
    assert_eq!(calc.published("/ActiveBatteryService"), json!("battery/2"));
}

#[tokio::test]
async fn service_mapping_paths_follow_lifecycle() {
    let mut calc = engine();
    add_battery(&mut calc, "com.victronenergy.battery.ttyO2", 2).await;
    assert_eq!(
        calc.published("/ServiceMapping/com_victronenergy_battery_2"),
        json!("com.victronenergy.battery.ttyO2")
    );

    remove_service(&mut calc, "com.victronenergy.battery.ttyO2").await;
    assert_eq!(
        calc.published("/ServiceMapping/com_victronenergy_battery_2"),
        Value::Null
    );
}

#[tokio::test]
async fn pv_inverter_product_ids_are_deduplicated() {
    let mut calc = engine();
    for (name, instance) in [
        ("com.victronenergy.pvinverter.fronius_1", 20u32),
        ("com.victronenergy.pvinverter.fronius_2", 21),
        ("com.victronenergy.pvinverter.solaredge", 22),
    ] {
        let pid = if instance == 22 { 0xB001 } else { 0xA142 };
        add_service(
            &mut calc,
            name,
            instance,
            &[
                ("/Connected", json!(1)),
                ("/ProductName", json!("PV inverter")),
                ("/Mgmt/Connection", json!("Ethernet")),
                ("/ProductId", json!(pid)),
            ],
        )
        .await;
    }
    assert_eq!(
        calc.published("/PvInvertersProductIds"),
        json!([0xA142, 0xB001])
    );
}
