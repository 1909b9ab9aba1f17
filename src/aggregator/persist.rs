use crate::error::{PersistError, Result};
use flate2::read::GzDecoder;
use std::path::{Path, PathBuf};
use tar::Archive;

use super::types::{ResultPayload, GLOBAL_NODE};

/// Writes a result's body to `<outputDir>/plugins/...` per the persistence
/// layout: tar-extract `application/gzip` bodies, synthetic failures to
/// `errors/<node>/error.json`, everything else to a single file.
pub fn persist(output_dir: &Path, result: &ResultPayload) -> Result<()> {
    if result.is_synthetic_failure() {
        return persist_error(output_dir, result);
    }

    if result.mime_type == "application/gzip" {
        persist_tar(output_dir, result)
    } else {
        persist_file(output_dir, result)
    }
}

fn normalize_node(node: &str) -> &str {
    if node.is_empty() {
        GLOBAL_NODE
    } else {
        node
    }
}

fn results_dir(output_dir: &Path, plugin: &str, node: &str) -> PathBuf {
    output_dir
        .join("plugins")
        .join(plugin)
        .join("results")
        .join(normalize_node(node))
}

fn errors_dir(output_dir: &Path, plugin: &str, node: &str) -> PathBuf {
    output_dir
        .join("plugins")
        .join(plugin)
        .join("errors")
        .join(normalize_node(node))
}

fn persist_file(output_dir: &Path, result: &ResultPayload) -> Result<()> {
    let dir = results_dir(output_dir, &result.plugin, &result.node);
    std::fs::create_dir_all(&dir).map_err(PersistError::Io)?;

    let filename = result
        .filename
        .as_deref()
        .filter(|f| !f.is_empty())
        .unwrap_or("result");
    let path = dir.join(filename);
    std::fs::write(&path, &result.body).map_err(PersistError::Io)?;
    Ok(())
}

fn persist_tar(output_dir: &Path, result: &ResultPayload) -> Result<()> {
    let dir = results_dir(output_dir, &result.plugin, &result.node);
    std::fs::create_dir_all(&dir).map_err(PersistError::Io)?;

    let decoder = GzDecoder::new(result.body.as_ref());
    let mut archive = Archive::new(decoder);
    archive
        .unpack(&dir)
        .map_err(|e| PersistError::TarExtract(e.to_string()))?;
    Ok(())
}

fn persist_error(output_dir: &Path, result: &ResultPayload) -> Result<()> {
    let dir = errors_dir(output_dir, &result.plugin, &result.node);
    std::fs::create_dir_all(&dir).map_err(PersistError::Io)?;

    let path = dir.join("error.json");
    std::fs::write(&path, &result.body).map_err(PersistError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn result(plugin: &str, node: &str, mime: &str, body: &str) -> ResultPayload {
        ResultPayload {
            plugin: plugin.to_string(),
            node: node.to_string(),
            mime_type: mime.to_string(),
            filename: Some("systemd_logs.json".to_string()),
            body: Bytes::from(body.to_string()),
            error_message: None,
        }
    }

    #[test]
    fn persists_plain_result_to_named_file() {
        let tmp = tempfile::tempdir().unwrap();
        let r = result("systemd_logs", "node1", "application/json", "foo");
        persist(tmp.path(), &r).unwrap();
        let written = std::fs::read_to_string(
            tmp.path()
                .join("plugins/systemd_logs/results/node1/systemd_logs.json"),
        )
        .unwrap();
        assert_eq!(written, "foo");
    }

    #[test]
    fn defaults_filename_to_result() {
        let tmp = tempfile::tempdir().unwrap();
        let mut r = result("e2e", "global", "text/plain", "bar");
        r.filename = None;
        persist(tmp.path(), &r).unwrap();
        let written =
            std::fs::read_to_string(tmp.path().join("plugins/e2e/results/global/result")).unwrap();
        assert_eq!(written, "bar");
    }

    #[test]
    fn persists_synthetic_failure_to_error_json() {
        let tmp = tempfile::tempdir().unwrap();
        let r = ResultPayload::synthetic_error("e2e", "global", "foo");
        persist(tmp.path(), &r).unwrap();
        let written =
            std::fs::read_to_string(tmp.path().join("plugins/e2e/errors/global/error.json"))
                .unwrap();
        assert_eq!(written, r#"{"error":"foo"}"#);
    }
}
