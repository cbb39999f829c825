use crate::settings::{is_secret, mask_secret, SETTING_KEYS};
use crate::App;
use std::collections::HashMap;

/// Stored settings, with API keys masked for display.
pub fn get_settings(app: &App) -> Result<HashMap<String, String>, String> {
    let db = app.database();
    let mut map = HashMap::new();
    for key in SETTING_KEYS {
        if let Some(value) = db.get_setting(key).map_err(|e| e.to_string())? {
            let shown = if is_secret(key) {
                mask_secret(&value)
            } else {
                value
            };
            map.insert(key.to_string(), shown);
        }
    }
    Ok(map)
}

/// Writes one setting and reloads the app configuration.
pub fn set_setting(app: &mut App, key: String, value: String) -> Result<(), String> {
    if !SETTING_KEYS.contains(&key.as_str()) {
        return Err(format!("Unknown setting key: {}", key));
    }
    if key == "max_image_bytes" && value.parse::<usize>().is_err() {
        return Err(format!("max_image_bytes must be a byte count, got {:?}", value));
    }
    app.database()
        .set_setting(&key, &value)
        .map_err(|e| e.to_string())?;
    app.reload_settings().map_err(|e| e.to_string())
}

pub fn delete_setting(app: &mut App, key: String) -> Result<(), String> {
    app.database()
        .delete_setting(&key)
        .map_err(|e| e.to_string())?;
    app.reload_settings().map_err(|e| e.to_string())
}
