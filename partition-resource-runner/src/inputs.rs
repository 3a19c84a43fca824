use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

/// Where the desired partition parameters come from.
///
/// NOTE (loss of ordering): clap does not tell us in which order flags were
/// given, so a later `--param-*` cannot override an earlier one. Duplicates
/// are rejected instead, which keeps the door open for override semantics.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct InputArgs {
    /// The (whole) JSON parameters for the partition
    ///
    /// A JSON object such as `{"name": "foo", "route_domain": 1}`.
    #[arg(long("params-json"), conflicts_with = "params_file")]
    pub params_json: Option<String>,

    /// A file holding the (whole) JSON parameters for the partition
    #[arg(long("params-file"))]
    pub params_file: Option<PathBuf>,

    /// An individual parameter, in JSON format
    #[arg(long("param-json"), short('j'), num_args = 2, value_names = &["NAME", "JSON"])]
    pub param_json: Vec<String>,

    /// An individual parameter, as a raw string.
    ///
    /// This is equivalent to `--param-json NAME JSON` if JSON is the JSON string formatting of STR.
    #[arg(long("param-str"), short('s'), num_args = 2, value_names = &["NAME", "STR"])]
    pub param_str: Vec<String>,
}

impl InputArgs {
    /// Merge all sources into one parameter map.
    pub fn gather(&self) -> Result<Map<String, Value>> {
        let mut params = match (&self.params_json, &self.params_file) {
            (Some(json), _) => {
                parse_object(json).context("failed to parse value of --params-json")?
            }
            (None, Some(path)) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                parse_object(&contents)
                    .with_context(|| format!("failed to parse parameters in {}", path.display()))?
            }
            (None, None) => Map::new(),
        };

        for pair in self.param_json.chunks(2) {
            let [name, json] = pair else {
                bail!("--param-json takes a NAME and a JSON value");
            };
            let value = serde_json::from_str(json)
                .with_context(|| format!("failed to parse JSON value for parameter: {}", name))?;
            insert_unique(&mut params, name, value)?;
        }
        for pair in self.param_str.chunks(2) {
            let [name, s] = pair else {
                bail!("--param-str takes a NAME and a string");
            };
            insert_unique(&mut params, name, Value::String(s.clone()))?;
        }

        Ok(params)
    }
}

fn parse_object(json: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(json)? {
        Value::Object(o) => Ok(o),
        other => bail!("expected a JSON object, got {}", other),
    }
}

fn insert_unique(params: &mut Map<String, Value>, name: &str, value: Value) -> Result<()> {
    if params.contains_key(name) {
        // No overriding; see note "loss of ordering"
        bail!("duplicate parameter: {}", name);
    }
    params.insert(name.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(xs: &[&str]) -> Vec<String> {
        xs.iter().map(|x| x.to_string()).collect()
    }

    #[test]
    fn test_gather_empty() {
        assert_eq!(InputArgs::default().gather().unwrap(), Map::new());
    }

    #[test]
    fn test_gather_all_sources() {
        let args = InputArgs {
            params_json: Some(r#"{"name": "foo"}"#.to_string()),
            param_json: strings(&["route_domain", "1"]),
            param_str: strings(&["description", "my description"]),
            ..Default::default()
        };
        assert_eq!(
            Value::Object(args.gather().unwrap()),
            json!({"name": "foo", "route_domain": 1, "description": "my description"})
        );
    }

    #[test]
    fn test_param_str_keeps_numeric_text() {
        let args = InputArgs {
            param_str: strings(&["name", "foo", "route_domain", "0"]),
            ..Default::default()
        };
        assert_eq!(
            Value::Object(args.gather().unwrap()),
            json!({"name": "foo", "route_domain": "0"})
        );
    }

    #[test]
    fn test_gather_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(&path, r#"{"name": "foo", "description": "from file"}"#).unwrap();
        let args = InputArgs {
            params_file: Some(path),
            ..Default::default()
        };
        assert_eq!(
            Value::Object(args.gather().unwrap()),
            json!({"name": "foo", "description": "from file"})
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let args = InputArgs {
            params_json: Some(r#"{"name": "foo"}"#.to_string()),
            param_str: strings(&["name", "bar"]),
            ..Default::default()
        };
        let err = args.gather().unwrap_err();
        assert!(err.to_string().contains("duplicate parameter: name"));
    }

    #[test]
    fn test_invalid_json_value() {
        let args = InputArgs {
            param_json: strings(&["route_domain", "one"]),
            ..Default::default()
        };
        assert!(args.gather().is_err());
    }

    #[test]
    fn test_params_json_must_be_object() {
        let args = InputArgs {
            params_json: Some("[1, 2]".to_string()),
            ..Default::default()
        };
        assert!(args.gather().is_err());
    }
}
