//! VirtualHID driver version inspection.
use quick_xml::{Reader, events::Event};
use std::{fs, path::Path};
use tracing::{debug, warn};

const VERSION_KEY: &str = "CFBundleShortVersionString";

/// Reads the bundle version from the driver's `Info.plist`.
///
/// Returns `None` when the file is missing, unreadable, or has no version key.
pub fn installed_version(info_plist: &Path) -> Option<String> {
    let content = match fs::read_to_string(info_plist) {
        Ok(content) => content,
        Err(err) => {
            debug!("No driver bundle metadata at {}: {err}", info_plist.display());
            return None;
        }
    };
    bundle_version(&content)
}

/// Extracts `CFBundleShortVersionString` from property-list XML.
pub fn bundle_version(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current_tag = String::new();
    let mut last_key: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                current_tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
            }
            Ok(Event::Text(text)) => {
                let value = match text.unescape() {
                    Ok(value) => value.into_owned(),
                    Err(err) => {
                        warn!("Malformed text in driver Info.plist: {err}");
                        continue;
                    }
                };
                match current_tag.as_str() {
                    "key" => last_key = Some(value),
                    "string" if last_key.as_deref() == Some(VERSION_KEY) => {
                        return Some(value.trim().to_string());
                    }
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current_tag.clear(),
            Ok(Event::Eof) => return None,
            Ok(_) => {}
            Err(err) => {
                warn!("Failed to parse driver Info.plist: {err}");
                return None;
            }
        }
    }
}

/// Returns `true` when the installed driver is absent or differs from
/// `expected`.
pub fn version_mismatch(installed: Option<&str>, expected: &str) -> bool {
    installed.is_none_or(|version| version != expected)
}
