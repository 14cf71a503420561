//! Strict YAML parsing for clawfiles.

use std::fs;
use std::path::Path;

use thiserror::Error;

use super::schema::Clawfile;

/// Errors produced while reading or decoding a clawfile.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The clawfile could not be read from disk.
    #[error("read clawfile {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid strict YAML for the `metaclaw/v1` schema.
    /// Unknown fields, duplicate keys, and invalid enum values all land
    /// here.
    #[error("parse yaml ({file}): {source}")]
    Yaml {
        /// Basename of the offending file.
        file: String,
        /// Underlying decode error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// Reads and strictly decodes a clawfile.
///
/// # Errors
///
/// Returns [`ParseError::Read`] on I/O failure and [`ParseError::Yaml`] on
/// any schema violation.
pub fn parse_file(path: &Path) -> Result<Clawfile, ParseError> {
    let bytes = fs::read(path).map_err(|source| ParseError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let file = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    parse_bytes(&bytes, &file)
}

/// Strictly decodes clawfile bytes; `file` names the source in diagnostics.
///
/// # Errors
///
/// Returns [`ParseError::Yaml`] on any schema violation.
pub fn parse_bytes(bytes: &[u8], file: &str) -> Result<Clawfile, ParseError> {
    serde_yaml::from_slice(bytes).map_err(|source| ParseError::Yaml {
        file: file.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
apiVersion: metaclaw/v1
kind: Agent
agent:
  name: hello-agent
  species: nano
";

    #[test]
    fn parses_minimal_clawfile() {
        let cfg = parse_bytes(MINIMAL.as_bytes(), "agent.claw").unwrap();
        assert_eq!(cfg.agent.name, "hello-agent");
        assert!(cfg.agent.lifecycle.is_none());
        assert!(cfg.agent.runtime.image.is_none());
    }

    #[test]
    fn rejects_unknown_field() {
        let doc = format!("{MINIMAL}  habitat:\n    netwrok: {{}}\n");
        let err = parse_bytes(doc.as_bytes(), "agent.claw").unwrap_err();
        assert!(err.to_string().contains("agent.claw"));
    }

    #[test]
    fn rejects_invalid_enum_value() {
        let doc = MINIMAL.replace("species: nano", "species: giga");
        assert!(parse_bytes(doc.as_bytes(), "agent.claw").is_err());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = parse_file(Path::new("/definitely/not/here.claw")).unwrap_err();
        assert!(matches!(err, ParseError::Read { .. }));
    }
}
