use std::path::Path;

use blockshift_blob_store::{BlobUri, Credential};

use crate::TransferError;
use crate::types::{DownloadRequest, DownloadTarget, UploadRequest, UploadSource};

/// Checks an upload request before any I/O.
///
/// Rejects:
/// - A pre-signed URI combined with an ambient credential
/// - An empty source path
pub fn validate_upload(request: &UploadRequest) -> Result<(), TransferError> {
    validate_credentials(&request.destination, &request.options.credential)?;
    if let UploadSource::Path(path) = &request.source {
        validate_local_path(path)?;
    }
    Ok(())
}

/// Checks a download request before any I/O.
///
/// Range bounds against the object length are checked once its length is
/// known.
pub fn validate_download(request: &DownloadRequest) -> Result<(), TransferError> {
    validate_credentials(&request.source, &request.options.credential)?;
    if let DownloadTarget::Path(path) = &request.destination {
        validate_local_path(path)?;
    }
    Ok(())
}

fn validate_credentials(uri: &BlobUri, credential: &Credential) -> Result<(), TransferError> {
    if uri.has_signature() && credential.is_ambient() {
        return Err(TransferError::Argument(format!(
            "{} carries a signature; an ambient credential cannot be combined with it",
            uri.path()
        )));
    }
    Ok(())
}

fn validate_local_path(path: &Path) -> Result<(), TransferError> {
    if path.as_os_str().is_empty() {
        return Err(TransferError::Argument("empty local path".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::types::TransferOptions;

    fn uri(raw: &str) -> BlobUri {
        BlobUri::parse(raw).unwrap()
    }

    fn ambient() -> TransferOptions {
        TransferOptions {
            credential: Credential::Ambient("key".into()),
            ..TransferOptions::default()
        }
    }

    #[test]
    fn rejects_signature_with_ambient_credential() {
        let request = UploadRequest::new(
            UploadSource::Path("a.bin".into()),
            uri("https://h/c/a.bin?sig=abc"),
        )
        .with_options(ambient());
        assert!(matches!(
            validate_upload(&request),
            Err(TransferError::Argument(_))
        ));
    }

    #[test]
    fn accepts_either_credential_alone() {
        let signed = UploadRequest::new(
            UploadSource::Path("a.bin".into()),
            uri("https://h/c/a.bin?sig=abc"),
        );
        assert!(validate_upload(&signed).is_ok());

        let keyed = DownloadRequest::new(
            uri("https://h/c/a.bin"),
            DownloadTarget::Path("a.bin".into()),
        )
        .with_options(ambient());
        assert!(validate_download(&keyed).is_ok());
    }

    #[test]
    fn rejects_empty_local_path() {
        let request = DownloadRequest::new(
            uri("https://h/c/a.bin"),
            DownloadTarget::Path(PathBuf::new()),
        );
        assert!(matches!(
            validate_download(&request),
            Err(TransferError::Argument(_))
        ));
    }

    #[test]
    fn streams_skip_path_checks() {
        let request = UploadRequest::new(
            UploadSource::Reader {
                reader: Box::new(tokio::io::empty()),
                length: 0,
            },
            uri("https://h/c/a.bin"),
        );
        assert!(validate_upload(&request).is_ok());
    }
}
