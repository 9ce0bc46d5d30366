#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // The setting parser must never panic on user-controlled input
        let _ = systemcalc::settings::BatterySetting::parse(s);

        // Neither may the display formatter, whatever path/value pair it sees
        let value = serde_json::json!(s);
        let _ = systemcalc::dbus::format_path_value(s, &value);
        let _ = systemcalc::dbus::format_path_value("/Dc/Battery/State", &value);
    }
});
