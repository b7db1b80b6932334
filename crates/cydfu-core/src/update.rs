//! Update orchestration: enter, publish metadata, stream rows, verify, exit.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Result as AnyResult, bail};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::events::{DfuEvent, DfuObserver, LogLevel, TracingObserver, UpdatePhase};
use crate::payload::{Cyacd2Image, ImageError, Row};
use crate::protocol::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::session::{DeviceInfo, DfuError, DfuSession};
use crate::state::{UpdateContext, UpdateState};
use crate::transport::Transport;

/// Update tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Largest row slice sent per sendData / programData.
    pub chunk_size: usize,
    /// Sent in enterDFU instead of the image header's product id.
    pub product_id: Option<u32>,
    /// Used for metadata and verification instead of the image header's app id.
    pub app_id: Option<u8>,
    /// Send exitDFU after a failure while the session is open.
    pub exit_on_failure: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            product_id: None,
            app_id: None,
            exit_on_failure: true,
        }
    }
}

impl UpdateConfig {
    pub fn validate(&self) -> AnyResult<()> {
        if !(1..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            bail!(
                "update.chunk_size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE,
                self.chunk_size
            );
        }
        Ok(())
    }
}

/// What went wrong, with the original error preserved.
#[derive(Error, Debug)]
pub enum UpdateErrorKind {
    #[error(transparent)]
    Dfu(#[from] DfuError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("Device reports application {app_id} as invalid")]
    VerificationFailed { app_id: u8 },
}

#[derive(Error, Debug)]
#[error("Update failed during {phase}")]
pub struct UpdateError {
    pub phase: UpdatePhase,
    #[source]
    pub kind: UpdateErrorKind,
}

impl UpdateError {
    pub fn new(phase: UpdatePhase, kind: impl Into<UpdateErrorKind>) -> Self {
        Self {
            phase,
            kind: kind.into(),
        }
    }
}

/// Summary of a successful update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub device: DeviceInfo,
    pub app_id: u8,
    pub rows: usize,
    pub bytes: u64,
}

/// Drives one device through a complete update.
pub struct UpdateOrchestrator<T: Transport, O: DfuObserver> {
    session: DfuSession<T>,
    config: UpdateConfig,
    observer: Arc<O>,
    ctx: UpdateContext,
}

impl<T: Transport> UpdateOrchestrator<T, TracingObserver> {
    /// Create an orchestrator with the default tracing observer.
    pub fn new(session: DfuSession<T>, config: UpdateConfig) -> Self {
        Self::with_observer(session, config, Arc::new(TracingObserver))
    }
}

impl<T: Transport, O: DfuObserver> UpdateOrchestrator<T, O> {
    pub fn with_observer(session: DfuSession<T>, config: UpdateConfig, observer: Arc<O>) -> Self {
        Self {
            session,
            config,
            observer,
            ctx: UpdateContext::new(),
        }
    }

    pub fn state(&self) -> UpdateState {
        self.ctx.state
    }

    pub fn context(&self) -> &UpdateContext {
        &self.ctx
    }

    pub fn session(&self) -> &DfuSession<T> {
        &self.session
    }

    pub fn into_session(self) -> DfuSession<T> {
        self.session
    }

    /// Program `image` into the device.
    ///
    /// Stops at the first error. If the device session is open at that point,
    /// exitDFU is still attempted; its own failure is only logged.
    #[instrument(skip_all, fields(app_id = image.header().app_id))]
    pub fn run<R: BufRead>(
        &mut self,
        image: &mut Cyacd2Image<R>,
    ) -> Result<UpdateReport, UpdateError> {
        self.ctx = UpdateContext::new();
        self.ctx.app_length = u64::from(image.app_descriptor().length);

        match self.run_steps(image) {
            Ok(report) => Ok(report),
            Err(err) => {
                let session_open = self.ctx.state.is_session_open();
                self.observer.on_event(&DfuEvent::Error {
                    phase: err.phase,
                    message: err.kind.to_string(),
                });
                let from = self.ctx.state;
                self.ctx.fail();
                if self.ctx.state != from {
                    self.observer.on_event(&DfuEvent::PhaseChanged {
                        from,
                        to: self.ctx.state,
                    });
                }

                if session_open && self.config.exit_on_failure {
                    self.exit_best_effort();
                }
                Err(err)
            }
        }
    }

    fn run_steps<R: BufRead>(
        &mut self,
        image: &mut Cyacd2Image<R>,
    ) -> Result<UpdateReport, UpdateError> {
        let header = *image.header();
        let app = *image.app_descriptor();
        let product_id = self.config.product_id.unwrap_or(header.product_id);
        let app_id = self.config.app_id.unwrap_or(header.app_id);

        self.log(
            LogLevel::Info,
            format!("Entering DFU with product ID 0x{product_id:08X}"),
        );
        let device = self
            .session
            .enter_dfu(product_id)
            .map_err(|e| UpdateError::new(UpdatePhase::Enter, e))?;
        self.observer.on_event(&DfuEvent::DeviceIdentified {
            jtag_id: device.jtag_id,
            device_revision: device.device_revision,
            sdk_version: device.sdk_version,
        });
        self.transition(UpdateState::SessionOpen);

        self.session
            .set_application_metadata(app_id, app.start_address, app.length)
            .map_err(|e| UpdateError::new(UpdatePhase::Metadata, e))?;
        self.transition(UpdateState::MetadataSet);

        let total = image.row_count();
        for (index, row) in image.rows().enumerate() {
            let row = row.map_err(|e| {
                UpdateError::new(
                    UpdatePhase::Row {
                        index,
                        total,
                        address: None,
                    },
                    e,
                )
            })?;

            self.transition(UpdateState::Streaming(index));
            self.program_row(index, total, &row).map_err(|e| {
                UpdateError::new(
                    UpdatePhase::Row {
                        index,
                        total,
                        address: Some(row.address),
                    },
                    e,
                )
            })?;

            self.ctx.record_row(row.data.len());
            self.observer.on_event(&DfuEvent::Progress {
                current: self.ctx.bytes_programmed,
                total: self.ctx.app_length,
            });
        }

        self.log(
            LogLevel::Info,
            format!(
                "Verifying application {app_id} after {} rows",
                self.ctx.rows_programmed
            ),
        );
        let valid = self
            .session
            .verify_application(app_id)
            .map_err(|e| UpdateError::new(UpdatePhase::Verify, e))?;
        if !valid {
            return Err(UpdateError::new(
                UpdatePhase::Verify,
                UpdateErrorKind::VerificationFailed { app_id },
            ));
        }
        self.transition(UpdateState::Verified);

        self.exit_best_effort();
        self.transition(UpdateState::Closed);
        self.observer.on_event(&DfuEvent::Complete);

        Ok(UpdateReport {
            device,
            app_id,
            rows: self.ctx.rows_programmed,
            bytes: self.ctx.bytes_programmed,
        })
    }

    /// Stream one row: every chunk but the last with sendData, the last with
    /// programData carrying the CRC-32C of the whole row.
    fn program_row(&self, index: usize, total: Option<usize>, row: &Row) -> Result<(), DfuError> {
        self.observer.on_event(&DfuEvent::RowStarted {
            index,
            total,
            address: row.address,
            len: row.data.len(),
        });

        let chunk_size = self.config.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        let checksum = row.checksum();
        let last_start = row.data.len().saturating_sub(1) / chunk_size * chunk_size;
        let (body, last) = row.data.split_at(last_start);

        for chunk in body.chunks(chunk_size) {
            self.session.send_data(chunk)?;
        }
        debug!(
            address = %format!("0x{:08X}", row.address),
            checksum = %format!("0x{:08X}", checksum),
            "Programming row"
        );
        self.session.program_data(row.address, checksum, last)
    }

    fn exit_best_effort(&self) {
        if let Err(e) = self.session.exit_dfu() {
            warn!("exitDFU failed: {}", e);
            self.observer.on_event(&DfuEvent::Error {
                phase: UpdatePhase::Exit,
                message: e.to_string(),
            });
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        self.observer.on_event(&DfuEvent::Log { level, message });
    }

    fn transition(&mut self, to: UpdateState) {
        let from = self.ctx.state;
        self.ctx.goto_state(to);
        self.observer
            .on_event(&DfuEvent::PhaseChanged { from, to });
    }
}
