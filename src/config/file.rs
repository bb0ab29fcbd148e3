//! Parser for the `gpupgrade initialize --file` parameter file.
//!
//! One `name = value` per line. `#` starts a comment anywhere on a line.
//! Names use underscores and are mapped to flag names by replacing `_`
//! with `-`.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

pub fn parse_config(text: &str) -> Result<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();

    for raw in text.lines() {
        let line = raw.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let (name, value) = line.split_once('=').ok_or_else(|| {
            Error::Validation(format!("parameter {:?} is not of the form name = value", line))
        })?;

        let name = name.trim();
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::Validation(format!("no value found for parameter {:?}", name)));
        }

        let flag = name.replace('_', "-");
        if params.contains_key(&flag) {
            return Err(Error::Validation(format!("parameter {:?} declared more than once", name)));
        }

        params.insert(flag, value.to_string());
    }

    Ok(params)
}
