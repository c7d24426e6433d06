//! Token file IO. Two formats, chosen by extension: JSON (lines starting
//! with `#` are treated as comments) and TOML. Both carry the same four
//! collections: groups, users, superusers, admins.

use std::path::{Path, PathBuf};

use fanout_types::TokensFile;

use super::AuthError;

pub fn load(path: &Path) -> Result<TokensFile, AuthError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| AuthError::Io(path.to_path_buf(), err.to_string()))?;

    match extension(path) {
        Some("json") => {
            let without_comments: String = raw
                .lines()
                .filter(|line| !line.starts_with('#'))
                .collect::<Vec<_>>()
                .join("\n");
            serde_json::from_str(&without_comments)
                .map_err(|err| AuthError::Parse(path.to_path_buf(), err.to_string()))
        }
        Some("toml") => toml::from_str(&raw)
            .map_err(|err| AuthError::Parse(path.to_path_buf(), err.to_string())),
        _ => Err(AuthError::UnsupportedFormat(path.to_path_buf())),
    }
}

pub fn serialize(tokens: &TokensFile, path: &Path) -> Result<String, AuthError> {
    match extension(path) {
        Some("json") => serde_json::to_string_pretty(tokens)
            .map_err(|err| AuthError::Parse(path.to_path_buf(), err.to_string())),
        Some("toml") => toml::to_string(tokens)
            .map_err(|err| AuthError::Parse(path.to_path_buf(), err.to_string())),
        _ => Err(AuthError::UnsupportedFormat(path.to_path_buf())),
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

/// Moves the current file into a `tokens_backups/` sibling directory
/// under a timestamped name. Collisions are retried with short sleeps a
/// bounded number of times.
pub fn backup(path: &Path) -> Result<(), AuthError> {
    const BACKUP_DIR: &str = "tokens_backups";
    const TIMESTAMP: &str = "%Y-%m-%d_%H-%M-%S";
    const MAX_RETRIES: usize = 16;

    if !path.exists() {
        // nothing to back up on the first save
        return Ok(());
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let backup_dir = parent.join(BACKUP_DIR);
    if !backup_dir.is_dir() {
        std::fs::create_dir(&backup_dir)
            .map_err(|err| AuthError::Io(backup_dir.clone(), err.to_string()))?;
    }

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| AuthError::UnsupportedFormat(path.to_path_buf()))?;

    let mut target: PathBuf;
    let mut retries = 0;
    loop {
        let stamp = chrono::Local::now().format(TIMESTAMP);
        target = backup_dir.join(format!("{}{}", stamp, file_name));
        if !target.exists() {
            break;
        }
        retries += 1;
        if retries >= MAX_RETRIES {
            return Err(AuthError::BackupExhausted(target));
        }
        std::thread::sleep(std::time::Duration::from_millis(250));
    }

    std::fs::rename(path, &target).map_err(|err| AuthError::Io(target, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_types::ServiceRef;

    #[test]
    fn json_comment_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(
            &path,
            "# hand-maintained token list\n\
             {\n\"groups\": {\"net\": [0]},\n\"users\": {\"usertoken123\": [\"net\", 1]},\n\
             \"superusers\": [\"supertoken123\"],\n\"admins\": [\"admintoken123\"]\n}\n",
        )
        .unwrap();

        let tokens = load(&path).unwrap();
        assert_eq!(tokens.groups["net"], vec![0]);
        assert_eq!(
            tokens.users["usertoken123"],
            vec![ServiceRef::Group("net".into()), ServiceRef::Id(1)]
        );
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.toml");
        let tokens: TokensFile = toml::from_str(
            r#"
            superusers = ["supertoken123"]
            admins = []

            [groups]
            net = [0, 1]

            [users]
            usertoken123 = ["net"]
            "#,
        )
        .unwrap();

        std::fs::write(&path, serialize(&tokens, &path).unwrap()).unwrap();
        assert_eq!(load(&path).unwrap(), tokens);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.ini");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            load(&path),
            Err(AuthError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn backup_moves_the_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "{}").unwrap();

        backup(&path).unwrap();
        assert!(!path.exists());

        let backups: Vec<_> = std::fs::read_dir(dir.path().join("tokens_backups"))
            .unwrap()
            .collect();
        assert_eq!(backups.len(), 1);
    }
}
