// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bootpatch::patch::boot::{self, StageError};
use tracing::error;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    // Set up a cancel signal so we can properly clean up any temporary files.
    let cancel_signal = Arc::new(AtomicBool::new(false));
    {
        let signal = cancel_signal.clone();

        if let Err(e) = ctrlc::set_handler(move || {
            signal.store(true, Ordering::SeqCst);
        }) {
            eprintln!("Failed to set signal handler: {e}");
            return ExitCode::FAILURE;
        }
    }

    match bootpatch::cli::args::main(&LOGGING_INITIALIZED, &cancel_signal) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = e.chain().find_map(|c| {
                c.downcast_ref::<StageError>()
                    .map(|s| s.kind())
                    .or_else(|| c.downcast_ref::<boot::Error>().map(|e| e.kind()))
            });

            if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
                error!("{e:?}");
            } else {
                eprintln!("{e:?}");
            }

            match kind {
                Some(k) => ExitCode::from(k.exit_code()),
                None => ExitCode::FAILURE,
            }
        }
    }
}
