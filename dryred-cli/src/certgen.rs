// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use dryred::common::identity::PublicKey;
use std::path::{Path, PathBuf};
use tracing::instrument;

fn with_suffix(path: &Path, suffix: &str) -> Result<PathBuf> {
  let file_name = path
    .file_name()
    .and_then(|name| name.to_str())
    .context("Output path must end in a UTF-8 file name")?;
  Ok(path.with_file_name(format!("{}{}", file_name, suffix)))
}

/// Writes `<path>.pub.pem` and `<path>.priv.pem`, printing the public key to register with the broker
#[instrument]
pub async fn certgen_main(output_base_path: String, host_san: String) -> Result<()> {
  use std::fs;
  let path = PathBuf::from(output_base_path);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let cert =
    rcgen::generate_simple_self_signed(vec![host_san]).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  let public_key = PublicKey::from_certificate_der(&cert.serialize_der()?)
    .context("Generated certificate must carry a public key")?;
  fs::write(with_suffix(&path, ".pub.pem")?, &public_pem).context("Failed writing public key")?;
  fs::write(with_suffix(&path, ".priv.pem")?, &private_pem)
    .context("Failed writing private key")?;
  tracing::info!(fingerprint = %public_key.fingerprint(), "Certificate written");
  println!("{}", public_key.to_base64());
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::with_suffix;
  use std::path::Path;

  #[test]
  fn suffix_is_appended_to_file_name() {
    assert_eq!(
      with_suffix(Path::new("certs/back"), ".pub.pem").unwrap(),
      Path::new("certs/back.pub.pem")
    );
    assert!(with_suffix(Path::new("/"), ".pub.pem").is_err());
  }
}
