use serde::{Deserialize, Deserializer};

/// Deserializes a `Vec<String>` that may arrive either as a real
/// sequence (config file, re-serialized CLI args) or as one
/// comma-joined string (env vars). Empty segments are dropped, so
/// trailing commas are harmless.
pub fn comma_separated<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Joined(String),
        Split(Vec<String>),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Joined(joined) => joined
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        Raw::Split(split) => split,
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Holder {
        #[serde(deserialize_with = "super::comma_separated")]
        values: Vec<String>,
    }

    #[test]
    fn accepts_joined_strings_and_sequences() {
        let joined: Holder = serde_json::from_str(r#"{"values": "info, debug ,"}"#).unwrap();
        assert_eq!(joined.values, vec!["info", "debug"]);

        let split: Holder = serde_json::from_str(r#"{"values": ["info", "debug"]}"#).unwrap();
        assert_eq!(split.values, vec!["info", "debug"]);
    }

    #[test]
    fn single_value_without_commas() {
        let single: Holder = serde_json::from_str(r#"{"values": "info"}"#).unwrap();
        assert_eq!(single.values, vec!["info"]);
    }
}
