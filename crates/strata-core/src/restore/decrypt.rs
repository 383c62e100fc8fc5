use std::fs::File;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

use super::messages::{EncryptedVolume, MgrMsg, RestoreContext};
use crate::codec::decrypt_stream;
use crate::error::{Result, StrataError};
use crate::volume::{VolumeName, VolumeReader};

/// Decrypt worker: turn a fetched blob into an open, manifest-checked
/// volume reader. The encrypted temp is deleted as soon as the plaintext
/// exists; a MAC failure kills the volume, not the restore.
pub(crate) fn run_decryptor(
    ctx: RestoreContext,
    rx: Receiver<EncryptedVolume>,
    mgr_tx: Sender<MgrMsg>,
) {
    for enc in rx.iter() {
        if ctx.cancelled() {
            break;
        }
        let volume_id = enc.volume_id;
        match open_volume(&ctx, enc) {
            Ok((blob, reader)) => {
                let _ = mgr_tx.send(MgrMsg::VolumeReady {
                    volume_id,
                    blob,
                    reader: Arc::new(reader),
                });
            }
            Err(e) => {
                let _ = mgr_tx.send(MgrMsg::VolumeFailed {
                    volume_id,
                    reason: e.to_string(),
                });
            }
        }
    }
}

fn open_volume(ctx: &RestoreContext, enc: EncryptedVolume) -> Result<(TempPath, VolumeReader)> {
    let started = Instant::now();
    let EncryptedVolume {
        name, blob: fetched, ..
    } = enc;
    let parsed = VolumeName::parse(&name)?;

    let blob = match parsed.encryption {
        Some(ref cipher_name) => {
            let key = ctx.cipher_key.ok_or_else(|| {
                StrataError::Config(format!(
                    "volume '{name}' is encrypted but no key is configured"
                ))
            })?;
            let engine = ctx.registry.cipher(cipher_name, &key)?;

            let mut src = File::open(&fetched)?;
            let mut out = NamedTempFile::new_in(&ctx.tempdir)?;
            let n = decrypt_stream(engine.as_ref(), &mut src, out.as_file_mut())?;
            debug!(volume = %name, plaintext_bytes = n, "volume decrypted");
            drop(src);
            drop(fetched); // discard the encrypted temp
            out.into_temp_path()
        }
        None => fetched,
    };

    if started.elapsed().as_secs() > ctx.limits.decrypt_timeout_secs {
        return Err(StrataError::Timeout {
            stage: "decrypt",
            secs: ctx.limits.decrypt_timeout_secs,
        });
    }

    // Opening checks the container magic and the manifest's compatibility
    // before any block can be read from it.
    let reader = VolumeReader::open(&blob)?;
    Ok((blob, reader))
}
