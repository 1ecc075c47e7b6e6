//! Channel-driven processing stages that run on their own thread.

use crate::error::{Result, VoxError};
use crate::pipeline::error::{ErrorReporter, StationError, panic_message};
use crossbeam_channel::{Receiver, Sender};
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// A stage that turns each input into at most one output.
///
/// Several runners may share one input receiver; each item is then handled
/// by exactly one of them.
pub trait Station: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Processes a single input item.
    ///
    /// `Ok(None)` consumes the input without producing anything.
    fn process(&mut self, input: Self::Input) -> std::result::Result<Option<Self::Output>, StationError>;

    fn name(&self) -> &'static str;

    /// Called once when the input channel closes or a fatal error occurs.
    fn shutdown(&mut self) {}
}

/// Runs a station in a dedicated thread until its input closes.
pub struct StationRunner<S: Station> {
    handle: Option<JoinHandle<()>>,
    station_name: &'static str,
    _phantom: PhantomData<S>,
}

impl<S: Station> StationRunner<S> {
    /// Spawn `station` on a thread named `thread_name`.
    pub fn spawn(
        mut station: S,
        thread_name: String,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let station_name = station.name();

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                Self::run_station(&mut station, input_rx, output_tx, error_reporter);
            })
            .map_err(|e| VoxError::Other(format!("Failed to spawn {} thread: {}", station_name, e)))?;

        Ok(Self {
            handle: Some(handle),
            station_name,
            _phantom: PhantomData,
        })
    }

    fn run_station(
        station: &mut S,
        input_rx: Receiver<S::Input>,
        output_tx: Sender<S::Output>,
        error_reporter: Arc<dyn ErrorReporter>,
    ) {
        let station_name = station.name();

        while let Ok(input) = input_rx.recv() {
            match station.process(input) {
                Ok(Some(output)) => {
                    if output_tx.send(output).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(error @ StationError::Recoverable(_)) => {
                    error_reporter.report(station_name, &error);
                }
                Err(error @ StationError::Fatal(_)) => {
                    error_reporter.report(station_name, &error);
                    break;
                }
            }
        }

        station.shutdown();
    }

    /// Waits for the station thread to finish.
    pub fn join(mut self) -> std::result::Result<(), String> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|payload| {
                format!(
                    "Station '{}' thread panicked: {}",
                    self.station_name,
                    panic_message(payload.as_ref())
                )
            }),
            None => Ok(()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn name(&self) -> &'static str {
        self.station_name
    }
}
