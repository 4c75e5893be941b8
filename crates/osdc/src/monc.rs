//! Monitor client seam.

/// The slice of the monitor client the dispatch core needs: asking for newer
/// cluster maps and acknowledging the ones it has applied.
pub trait MonitorClient: Send + Sync {
    /// Ask the monitors for the osdmap at `epoch` (or anything newer).
    fn request_osdmap(&self, epoch: u32);

    /// Report the newest epoch this client has installed, so the monitors
    /// can trim their subscription state.
    fn got_osdmap(&self, epoch: u32);
}
