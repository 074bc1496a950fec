// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Activation of a staged application image

use crate::error::{FotaError, Result};
use crate::slot::UpdateResult;
use std::path::PathBuf;
use tracing::info;

/// Command-line flag telling a freshly activated image to report a late result
pub const DELAYED_RESULT_FLAG: &str = "--delayed-result";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRequest {
    pub image: PathBuf,
    /// Result the new image should conclude with after its start-up delay
    pub delayed_result: Option<UpdateResult>,
}

/// Replaces the running program with a staged image.
///
/// On success the production implementation never returns. The engine has
/// already persisted the state the new image expects to find.
pub trait Activator {
    fn activate(&mut self, request: &ActivationRequest) -> Result<()>;
}

/// Re-executes the process image in place with `execv`
#[derive(Debug, Clone, Default)]
pub struct ExecActivator {
    args: Vec<String>,
}

impl ExecActivator {
    /// `args` follow the program name on the new command line
    pub fn new(args: Vec<String>) -> Self {
        Self { args }
    }

    /// Full argv for the new image, program name first
    pub fn command_line(&self, request: &ActivationRequest) -> Vec<String> {
        let mut argv = vec![request.image.display().to_string()];
        if let Some(result) = request.delayed_result {
            argv.push(DELAYED_RESULT_FLAG.to_string());
            argv.push((result as u8).to_string());
        }
        argv.extend(self.args.iter().cloned());
        argv
    }
}

impl Activator for ExecActivator {
    #[cfg(unix)]
    fn activate(&mut self, request: &ActivationRequest) -> Result<()> {
        use nix::unistd::execv;
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path = CString::new(request.image.as_os_str().as_bytes())
            .map_err(|e| FotaError::Activation(format!("invalid image path: {e}")))?;
        let argv = self
            .command_line(request)
            .into_iter()
            .map(CString::new)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FotaError::Activation(format!("invalid argument: {e}")))?;

        info!("Re-executing into {}", request.image.display());
        match execv(&path, &argv) {
            Ok(never) => match never {},
            Err(errno) => Err(FotaError::Activation(format!(
                "execv {} failed: {errno}",
                request.image.display()
            ))),
        }
    }

    #[cfg(not(unix))]
    fn activate(&mut self, request: &ActivationRequest) -> Result<()> {
        Err(FotaError::Activation(format!(
            "cannot re-execute {} on this platform",
            request.image.display()
        )))
    }
}
