//! Rich display of `file:///data/...` outputs.
//!
//! A stdout stream or value whose text is a `file://` URL into the data
//! directory is replaced by a display bundle built from the file: JSON and
//! HTML by extension, images by their magic bytes, anything else as text.
//! Resolution failures become a stderr stream carrying the reason.

use std::fs;
use std::path::{Component, Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bscript_abi::{Output, StreamName};
use thiserror::Error;

const FILE_SCHEME: &str = "file://";
const DATA_URL_PREFIX: &str = "file:///data";

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("File '{0}' does not live in data directory: cannot show.")]
    OutsideDataDir(String),
    #[error("File '{0}' does not exist.")]
    Missing(String),
    #[error("Could not read '{path}': {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("File '{path}' is not valid JSON: {source}")]
    InvalidJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct DisplayResolver {
    data_dir: PathBuf,
}

impl DisplayResolver {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn resolve_all(&self, outputs: Vec<Output>) -> Vec<Output> {
        outputs.into_iter().map(|output| self.resolve(output)).collect()
    }

    pub fn resolve(&self, output: Output) -> Output {
        let text = match &output {
            Output::Stream {
                name: StreamName::Stdout,
                text,
            }
            | Output::Value { text } => text.trim(),
            _ => return output,
        };
        match self.file_output(text) {
            Ok(Some(display)) => display,
            Ok(None) => output,
            Err(err) => {
                log::warn!("cannot display file output: {err}");
                Output::stderr(format!("{err}\n"))
            }
        }
    }

    /// `Ok(None)` when `text` is not a file URL at all.
    pub fn file_output(&self, text: &str) -> Result<Option<Output>, DisplayError> {
        let Some(rest) = text.strip_prefix(DATA_URL_PREFIX) else {
            if text.starts_with(FILE_SCHEME) {
                return Err(DisplayError::OutsideDataDir(text.to_string()));
            }
            return Ok(None);
        };
        if !(rest.is_empty() || rest.starts_with('/')) {
            return Err(DisplayError::OutsideDataDir(text.to_string()));
        }
        // Only plain names below the data directory; `..` and roots escape it.
        let relative = Path::new(rest.trim_start_matches('/'));
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(DisplayError::OutsideDataDir(text.to_string()));
        }

        let path = self.data_dir.join(relative);
        let shown = path.display().to_string();
        if !path.is_file() {
            return Err(DisplayError::Missing(shown));
        }
        let bytes = fs::read(&path).map_err(|source| DisplayError::Unreadable {
            path: shown.clone(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let output = match extension.as_deref() {
            Some("json") => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|source| DisplayError::InvalidJson {
                        path: shown.clone(),
                        source,
                    })?;
                Output::display("application/json", value.to_string())
            }
            Some("html") => Output::display("text/html", String::from_utf8_lossy(&bytes)),
            _ => match image_mime(&bytes) {
                Some(mime) => Output::display(mime, STANDARD.encode(&bytes)),
                None => Output::display("text/plain", String::from_utf8_lossy(&bytes)),
            },
        };
        Ok(Some(output))
    }
}

/// MIME type of `bytes` when they look like an image.
pub fn image_mime(bytes: &[u8]) -> Option<&'static str> {
    infer::get(bytes)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.mime_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver() -> (TempDir, DisplayResolver) {
        let dir = TempDir::new().unwrap();
        let resolver = DisplayResolver::new(dir.path());
        (dir, resolver)
    }

    fn mime_of(output: &Output) -> Option<&str> {
        match output {
            Output::Display { data } => data.keys().next().map(String::as_str),
            _ => None,
        }
    }

    #[test]
    fn plain_text_passes_through() {
        let (_dir, resolver) = resolver();
        let output = Output::stdout("hello\n");
        assert_eq!(resolver.resolve(output.clone()), output);
        let stderr = Output::stderr("file:///data/x.json");
        assert_eq!(resolver.resolve(stderr.clone()), stderr);
    }

    #[test]
    fn json_html_and_text_files() {
        let (dir, resolver) = resolver();
        fs::write(dir.path().join("r.json"), br#"{ "a": [1, 2] }"#).unwrap();
        fs::write(dir.path().join("page.HTML"), "<b>hi</b>").unwrap();
        fs::write(dir.path().join("notes.txt"), "plain").unwrap();

        let json = resolver.resolve(Output::stdout("file:///data/r.json\n"));
        assert_eq!(json, Output::display("application/json", r#"{"a":[1,2]}"#));
        let html = resolver.resolve(Output::value("file:///data/page.HTML"));
        assert_eq!(html, Output::display("text/html", "<b>hi</b>"));
        let text = resolver.resolve(Output::stdout("file:///data/notes.txt"));
        assert_eq!(text, Output::display("text/plain", "plain"));
    }

    #[test]
    fn images_are_base64_encoded() {
        let (dir, resolver) = resolver();
        let png = b"\x89PNG\r\n\x1a\n\x00\x00".to_vec();
        fs::write(dir.path().join("plot.bin"), &png).unwrap();
        let output = resolver.resolve(Output::stdout("file:///data/plot.bin"));
        assert_eq!(mime_of(&output), Some("image/png"));
        assert_eq!(output, Output::display("image/png", STANDARD.encode(&png)));
    }

    #[test]
    fn missing_and_foreign_files_become_stderr() {
        let (dir, resolver) = resolver();
        let missing = resolver.resolve(Output::stdout("file:///data/nope.json"));
        let expected = format!(
            "File '{}' does not exist.\n",
            dir.path().join("nope.json").display()
        );
        assert_eq!(missing, Output::stderr(expected));

        let foreign = resolver.resolve(Output::stdout("file:///etc/passwd"));
        assert_eq!(
            foreign,
            Output::stderr(
                "File 'file:///etc/passwd' does not live in data directory: cannot show.\n"
            )
        );
        let sibling = resolver.resolve(Output::stdout("file:///database/x"));
        assert!(matches!(
            sibling,
            Output::Stream {
                name: StreamName::Stderr,
                ..
            }
        ));
    }

    #[test]
    fn parent_segments_cannot_leave_the_data_dir() {
        let root = TempDir::new().unwrap();
        let data = root.path().join("data");
        fs::create_dir(&data).unwrap();
        fs::write(root.path().join("secret.txt"), "TOP SECRET").unwrap();
        fs::create_dir(data.join("sub")).unwrap();
        fs::write(data.join("sub").join("ok.txt"), "fine").unwrap();
        let resolver = DisplayResolver::new(&data);

        for url in [
            "file:///data/../secret.txt",
            "file:///data/sub/../../secret.txt",
            "file:///data/./sub/ok.txt",
        ] {
            assert!(
                matches!(resolver.file_output(url), Err(DisplayError::OutsideDataDir(_))),
                "{url} should be rejected"
            );
        }
        let nested = resolver.file_output("file:///data/sub/ok.txt").unwrap();
        assert_eq!(nested, Some(Output::display("text/plain", "fine")));
    }

    #[test]
    fn sniffs_webp_and_rejects_short_input() {
        assert_eq!(image_mime(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(image_mime(b"RIFF"), None);
        assert_eq!(image_mime(b"{}"), None);
    }
}
