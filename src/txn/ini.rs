//! INI read/write helpers for applying ledgered edits to game config files

use ini::Ini;
use std::path::Path;

use crate::error::{Error, Result};

/// Read the literal at `[section] key`, if the file and key exist.
pub fn read_value(file: &Path, section: &str, key: &str) -> Result<Option<String>> {
    if !file.exists() {
        return Ok(None);
    }
    let doc = Ini::load_from_file(file)
        .map_err(|e| Error::Config(format!("parse {} failed: {e}", file.display())))?;
    Ok(find(&doc, section, key).map(str::to_string))
}

/// Write (or with `None`, delete) the literal at `[section] key`.
pub fn write_value(file: &Path, section: &str, key: &str, value: Option<&str>) -> Result<()> {
    let mut doc = if file.exists() {
        Ini::load_from_file(file)
            .map_err(|e| Error::Config(format!("parse {} failed: {e}", file.display())))?
    } else {
        Ini::new()
    };

    // Sections and keys are matched case-insensitively; writes reuse the
    // casing already in the file.
    let section_name = doc
        .iter()
        .filter_map(|(sec, _)| sec)
        .find(|s| s.eq_ignore_ascii_case(section))
        .unwrap_or(section)
        .to_string();
    let key_name = doc
        .section(Some(section_name.as_str()))
        .and_then(|props| {
            props
                .iter()
                .map(|(k, _)| k)
                .find(|k| k.eq_ignore_ascii_case(key))
        })
        .unwrap_or(key)
        .to_string();

    match value {
        Some(v) => {
            doc.with_section(Some(section_name.as_str()))
                .set(key_name.as_str(), v);
        }
        None => {
            if let Some(props) = doc.section_mut(Some(section_name.as_str())) {
                props.remove(key_name.as_str());
            }
        }
    }

    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    doc.write_to_file(file)
        .map_err(|e| Error::Config(format!("write {} failed: {e}", file.display())))?;
    Ok(())
}

fn find<'a>(doc: &'a Ini, section: &str, key: &str) -> Option<&'a str> {
    for (sec, props) in doc.iter() {
        let matches = match sec {
            Some(s) => s.eq_ignore_ascii_case(section),
            None => section.is_empty(),
        };
        if matches {
            for (k, v) in props.iter() {
                if k.eq_ignore_ascii_case(key) {
                    return Some(v);
                }
            }
        }
    }
    None
}
