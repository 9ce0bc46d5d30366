//! Human-readable text for published values
//!
//! Every output path carries a display format used by `GetText` and the
//! `Text` field of change signals. Unknown values render as an empty string,
//! matching the VeDbus convention for invalid items.

use serde_json::Value;

enum Fmt {
    Watts,
    Amps,
    Volts,
    Percent,
    Seconds,
    AmpHours,
    BatteryState,
    Plain,
}

fn fmt_for_path(path: &str) -> Fmt {
    match path {
        "/Dc/Battery/State" => Fmt::BatteryState,
        "/Dc/Battery/Voltage" => Fmt::Volts,
        "/Dc/Battery/Soc" => Fmt::Percent,
        "/Dc/Battery/TimeToGo" => Fmt::Seconds,
        "/Dc/Battery/ConsumedAmphours" => Fmt::AmpHours,
        "/Dc/Battery/Current" | "/Dc/Pv/Current" | "/Dc/Vebus/Current" => Fmt::Amps,
        _ if path.ends_with("/Power") => Fmt::Watts,
        _ => Fmt::Plain,
    }
}

/// Render a published value for human display
pub fn format_path_value(path: &str, value: &Value) -> String {
    if value.is_null() {
        return String::new();
    }
    match fmt_for_path(path) {
        Fmt::Watts => match value.as_f64() {
            Some(v) => format!("{:.0} W", v),
            None => plain(value),
        },
        Fmt::Amps => match value.as_f64() {
            Some(v) => format!("{:.1} A", v),
            None => plain(value),
        },
        Fmt::Volts => match value.as_f64() {
            Some(v) => format!("{:.2} V", v),
            None => plain(value),
        },
        Fmt::Percent => match value.as_f64() {
            Some(v) => format!("{:.0} %", v),
            None => plain(value),
        },
        Fmt::Seconds => match value.as_f64() {
            Some(v) => format!("{:.0} s", v),
            None => plain(value),
        },
        Fmt::AmpHours => match value.as_f64() {
            Some(v) => format!("{:.1} Ah", v),
            None => plain(value),
        },
        Fmt::BatteryState => match value.as_f64() {
            Some(v) if v == 0.0 => "Idle".to_string(),
            Some(v) if v == 1.0 => "Charging".to_string(),
            Some(v) if v == 2.0 => "Discharging".to_string(),
            _ => plain(value),
        },
        Fmt::Plain => plain(value),
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn power_paths_format_as_watts() {
        assert_eq!(
            format_path_value("/Ac/Grid/L1/Power", &json!(799.6)),
            "800 W"
        );
        assert_eq!(
            format_path_value("/Dc/System/Power", &json!(-12.4)),
            "-12 W"
        );
    }

    #[test]
    fn battery_paths_use_their_units() {
        assert_eq!(
            format_path_value("/Dc/Battery/Voltage", &json!(12.154)),
            "12.15 V"
        );
        assert_eq!(
            format_path_value("/Dc/Battery/Current", &json!(5.34)),
            "5.3 A"
        );
        assert_eq!(format_path_value("/Dc/Battery/Soc", &json!(15.3)), "15 %");
        assert_eq!(
            format_path_value("/Dc/Battery/ConsumedAmphours", &json!(-3.21)),
            "-3.2 Ah"
        );
    }

    #[test]
    fn battery_state_maps_to_names() {
        assert_eq!(format_path_value("/Dc/Battery/State", &json!(0)), "Idle");
        assert_eq!(format_path_value("/Dc/Battery/State", &json!(1)), "Charging");
        assert_eq!(
            format_path_value("/Dc/Battery/State", &json!(2)),
            "Discharging"
        );
    }

    #[test]
    fn null_renders_empty() {
        assert_eq!(format_path_value("/Hub", &Value::Null), "");
        assert_eq!(format_path_value("/Ac/Grid/L1/Power", &Value::Null), "");
    }

    #[test]
    fn plain_paths_pass_through() {
        assert_eq!(format_path_value("/Hub", &json!(4)), "4");
        assert_eq!(
            format_path_value("/VebusService", &json!("com.victronenergy.vebus.ttyO1")),
            "com.victronenergy.vebus.ttyO1"
        );
        assert_eq!(format_path_value("/Ac/Grid/NumberOfPhases", &json!(3)), "3");
    }
}
