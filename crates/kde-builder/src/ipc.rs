//! Typed, length-framed messages between the updater and builder.
//!
//! A message is a big-endian `u32` type tag followed by a UTF-8 payload;
//! on a byte transport each message is preceded by a big-endian `u32`
//! length so one whole message is read per frame. The same message
//! vocabulary flows over an in-process queue when the run is synchronous.

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::sync::mpsc;

use anyhow::{Context, Result, bail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgType {
    /// Successful source checkout.
    ModuleSuccess = 1,
    /// Failed source checkout.
    ModuleFailure = 2,
    /// Skipped source checkout (build anyway).
    ModuleSkipped = 3,
    /// No code updates; build may be skipped.
    ModuleUptodate = 4,
    /// The whole update process was skipped (build anyway).
    AllSkipped = 5,
    /// Major update failure; do not build.
    AllFailure = 6,
    /// Updates are underway; feel free to start building.
    AllUpdating = 7,
    /// Tagged message to put on the TTY for a module.
    ModuleLogMsg = 9,
    /// Change to a persistent module option.
    ModulePersistOpt = 10,
    /// All updates are done.
    AllDone = 11,
    /// A message to print after all work is done.
    ModulePostBuildMsg = 12,
}

impl TryFrom<u32> for MsgType {
    type Error = anyhow::Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            1 => MsgType::ModuleSuccess,
            2 => MsgType::ModuleFailure,
            3 => MsgType::ModuleSkipped,
            4 => MsgType::ModuleUptodate,
            5 => MsgType::AllSkipped,
            6 => MsgType::AllFailure,
            7 => MsgType::AllUpdating,
            9 => MsgType::ModuleLogMsg,
            10 => MsgType::ModulePersistOpt,
            11 => MsgType::AllDone,
            12 => MsgType::ModulePostBuildMsg,
            other => bail!("unhandled IPC message type {other}"),
        })
    }
}

pub fn encode_message(ty: MsgType, payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(ty as u32).to_be_bytes());
    out.extend_from_slice(payload.as_bytes());
    out
}

pub fn decode_message(bytes: &[u8]) -> Result<(MsgType, String)> {
    if bytes.len() < 4 {
        bail!("truncated IPC message ({} bytes)", bytes.len());
    }
    let ty = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let payload = String::from_utf8_lossy(&bytes[4..]).into_owned();
    Ok((MsgType::try_from(ty)?, payload))
}

/// Write one message as a length-prefixed frame.
pub fn write_frame(writer: &mut impl Write, message: &[u8]) -> Result<()> {
    writer
        .write_all(&(message.len() as u32).to_be_bytes())
        .context("IPC write failed")?;
    writer.write_all(message).context("IPC write failed")?;
    writer.flush().context("IPC flush failed")?;
    Ok(())
}

/// Read one frame; `None` on clean EOF before the length word.
pub fn read_frame(reader: &mut impl Read) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("IPC read failed"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .context("truncated IPC frame")?;
    Ok(Some(body))
}

/// Sending half of a channel.
pub trait IpcSender {
    fn send(&mut self, ty: MsgType, payload: &str) -> Result<()>;
}

/// Receiving half. `Ok(None)` means the other side is gone.
pub trait IpcReceiver {
    fn recv(&mut self) -> Result<Option<(MsgType, String)>>;
}

/// Fully synchronous channel: messages queue locally, already encoded, and
/// drain in order. Used when updater and builder share one process.
#[derive(Debug, Default)]
pub struct LocalQueue {
    queue: VecDeque<Vec<u8>>,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IpcSender for LocalQueue {
    fn send(&mut self, ty: MsgType, payload: &str) -> Result<()> {
        self.queue.push_back(encode_message(ty, payload));
        Ok(())
    }
}

impl IpcReceiver for LocalQueue {
    fn recv(&mut self) -> Result<Option<(MsgType, String)>> {
        match self.queue.pop_front() {
            Some(bytes) => decode_message(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// Sender writing frames to a byte sink (the worker's stdout pipe).
pub struct FrameSender<W: Write> {
    writer: W,
}

impl<W: Write> FrameSender<W> {
    pub fn new(writer: W) -> Self {
        FrameSender { writer }
    }
}

impl<W: Write> IpcSender for FrameSender<W> {
    fn send(&mut self, ty: MsgType, payload: &str) -> Result<()> {
        write_frame(&mut self.writer, &encode_message(ty, payload))
    }
}

/// Receiver reading frames from a byte source.
pub struct FrameReceiver<R: Read> {
    reader: R,
}

impl<R: Read> FrameReceiver<R> {
    pub fn new(reader: R) -> Self {
        FrameReceiver { reader }
    }
}

impl<R: Read> IpcReceiver for FrameReceiver<R> {
    fn recv(&mut self) -> Result<Option<(MsgType, String)>> {
        match read_frame(&mut self.reader)? {
            Some(bytes) => decode_message(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// Receiver fed by the monitor relay, which drains the updater at full
/// speed into an unbounded queue so a long build never stalls the updater.
pub struct ChannelReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelReceiver {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        ChannelReceiver { rx }
    }
}

impl IpcReceiver for ChannelReceiver {
    fn recv(&mut self) -> Result<Option<(MsgType, String)>> {
        match self.rx.recv() {
            Ok(bytes) => decode_message(&bytes).map(Some),
            Err(_) => Ok(None),
        }
    }
}

/// Convenience wrapper for the updater side.
pub struct UpdaterIpc<'a> {
    sender: &'a mut dyn IpcSender,
    logged_module: String,
}

impl<'a> UpdaterIpc<'a> {
    pub fn new(sender: &'a mut dyn IpcSender) -> Self {
        UpdaterIpc {
            sender,
            logged_module: "global".to_string(),
        }
    }

    /// Associate subsequent log messages with this module.
    pub fn set_logged_module(&mut self, module: &str) {
        self.logged_module = module.to_string();
    }

    pub fn notify_update_success(&mut self, module: &str, msg: &str) -> Result<()> {
        self.sender
            .send(MsgType::ModuleSuccess, &format!("{module},{msg}"))
    }

    pub fn notify_update_failure(&mut self, module: &str) -> Result<()> {
        self.sender.send(MsgType::ModuleFailure, module)
    }

    pub fn notify_update_skipped(&mut self, module: &str) -> Result<()> {
        self.sender.send(MsgType::ModuleSkipped, module)
    }

    pub fn notify_uptodate(&mut self, module: &str, refresh_reason: &str) -> Result<()> {
        self.sender
            .send(MsgType::ModuleUptodate, &format!("{module},{refresh_reason}"))
    }

    pub fn notify_persistent_option_change(
        &mut self,
        module: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.sender
            .send(MsgType::ModulePersistOpt, &format!("{module},{key},{value}"))
    }

    pub fn notify_post_build_message(&mut self, module: &str, msg: &str) -> Result<()> {
        self.sender
            .send(MsgType::ModulePostBuildMsg, &format!("{module},{msg}"))
    }

    pub fn send_log_message(&mut self, logger: &str, level: &str, msg: &str) -> Result<()> {
        let module = &self.logged_module;
        self.sender
            .send(MsgType::ModuleLogMsg, &format!("{module},{logger},{level},{msg}"))
    }

    pub fn all_updating(&mut self) -> Result<()> {
        self.sender.send(MsgType::AllUpdating, "")
    }

    pub fn all_done(&mut self) -> Result<()> {
        self.sender.send(MsgType::AllDone, "")
    }

    pub fn all_skipped(&mut self) -> Result<()> {
        self.sender.send(MsgType::AllSkipped, "")
    }

    pub fn all_failure(&mut self, why: &str) -> Result<()> {
        self.sender.send(MsgType::AllFailure, why)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub logger: String,
    pub level: String,
    pub text: String,
}

/// A forwarded persistent-option write, drained by the build-parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistWrite {
    pub module: String,
    pub key: String,
    pub value: String,
}

/// Builder-side bookkeeping over a receiver: which modules have reported,
/// buffered log output, deferred post-build messages.
#[derive(Debug, Default)]
pub struct IpcState {
    pub no_update: bool,
    updated: BTreeMap<String, UpdateStatus>,
    messages: BTreeMap<String, Vec<LogMessage>>,
    postbuild: BTreeMap<String, Vec<String>>,
    why_refresh: BTreeMap<String, String>,
    pub persist_writes: Vec<PersistWrite>,
    updates_done: bool,
    waited: bool,
}

impl IpcState {
    pub fn new() -> Self {
        Self::default()
    }

    /// A reason to rebuild a module that reported no new commits, if any.
    pub fn refresh_reason_for(&self, module: &str) -> String {
        self.why_refresh.get(module).cloned().unwrap_or_default()
    }

    /// Statuses for modules nobody waited on (diagnostics at end of run).
    pub fn unacknowledged_modules(&self) -> &BTreeMap<String, UpdateStatus> {
        &self.updated
    }

    pub fn forget_module(&mut self, module: &str) {
        self.updated.remove(module);
    }

    /// Block until one of the `ALL_*` stream-start markers arrives. Only
    /// the first call waits.
    pub fn wait_for_stream_start(&mut self, rx: &mut dyn IpcReceiver) -> Result<()> {
        if self.waited {
            return Ok(());
        }
        self.waited = true;

        loop {
            let Some((ty, payload)) = rx.recv()? else {
                bail!("IPC failure waiting for stream start");
            };
            match ty {
                MsgType::AllUpdating => return Ok(()),
                MsgType::AllFailure => {
                    bail!("unable to perform source update for any project:\n\t{payload}")
                }
                MsgType::AllSkipped => {
                    self.no_update = true;
                    self.updates_done = true;
                    return Ok(());
                }
                MsgType::ModuleLogMsg => {
                    self.buffer_log_message(&payload);
                }
                other => bail!("IPC failure while expecting an update status: {other:?}"),
            }
        }
    }

    /// Wait for the update outcome of one module, printing buffered log
    /// messages through `printer` as they become printable.
    pub fn wait_for_module(
        &mut self,
        rx: &mut dyn IpcReceiver,
        module: &str,
        has_update_phase: bool,
        printer: &mut dyn FnMut(&LogMessage),
    ) -> Result<(UpdateStatus, String)> {
        self.wait_for_stream_start(rx)?;

        if self.no_update || !has_update_phase {
            self.updated
                .insert(module.to_string(), UpdateStatus::Success);
            return Ok((UpdateStatus::Success, "Skipped".to_string()));
        }

        let mut message = String::new();
        while !self.updated.contains_key(module) && !self.updates_done {
            let Some((ty, payload)) = rx.recv()? else {
                bail!("IPC channel closed while waiting for {module}");
            };
            message = self.handle_message(ty, &payload)?;

            // Global messages are setup output that belongs before the
            // first module's own messages.
            for key in ["global", module] {
                if let Some(pending) = self.messages.remove(key) {
                    for msg in pending {
                        printer(&msg);
                    }
                }
            }
        }

        let status = self
            .updated
            .get(module)
            .copied()
            .unwrap_or(UpdateStatus::Failed);
        Ok((status, message))
    }

    /// Drain the channel until `ALL_DONE`, absorbing stragglers.
    pub fn wait_for_end(&mut self, rx: &mut dyn IpcReceiver) -> Result<()> {
        self.wait_for_stream_start(rx)?;
        while !self.no_update && !self.updates_done {
            match rx.recv()? {
                Some((ty, payload)) => {
                    self.handle_message(ty, &payload)?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Take the deferred post-build messages for a module.
    pub fn take_post_build_messages(&mut self, module: &str) -> Vec<String> {
        self.postbuild.remove(module).unwrap_or_default()
    }

    /// Any log messages still buffered at end of run.
    pub fn drain_pending_messages(&mut self) -> Vec<(String, LogMessage)> {
        let mut out = Vec::new();
        for (module, msgs) in std::mem::take(&mut self.messages) {
            for msg in msgs {
                if !msg.text.is_empty() {
                    out.push((module.clone(), msg));
                }
            }
        }
        out
    }

    fn handle_message(&mut self, ty: MsgType, payload: &str) -> Result<String> {
        let message = match ty {
            MsgType::ModuleSuccess => {
                let (module, msg) = split2(payload)?;
                self.updated.insert(module, UpdateStatus::Success);
                msg
            }
            MsgType::ModuleSkipped => {
                // "Skipped" here means the *build* should proceed even
                // though no update was performed.
                self.updated
                    .insert(payload.to_string(), UpdateStatus::Success);
                "skipped".to_string()
            }
            MsgType::ModuleFailure => {
                self.updated
                    .insert(payload.to_string(), UpdateStatus::Failed);
                "update failed".to_string()
            }
            MsgType::ModuleUptodate => {
                let (module, refresh_reason) = split2(payload)?;
                if refresh_reason.is_empty() {
                    self.updated.insert(module, UpdateStatus::Skipped);
                } else {
                    self.updated.insert(module.clone(), UpdateStatus::Success);
                    self.why_refresh.insert(module, refresh_reason);
                }
                "no commits pulled".to_string()
            }
            MsgType::ModulePersistOpt => {
                let mut parts = payload.splitn(3, ',');
                let (Some(module), Some(key), Some(value)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    bail!("malformed MODULE_PERSIST_OPT payload");
                };
                self.persist_writes.push(PersistWrite {
                    module: module.to_string(),
                    key: key.to_string(),
                    value: value.to_string(),
                });
                String::new()
            }
            MsgType::ModuleLogMsg => {
                self.buffer_log_message(payload);
                String::new()
            }
            MsgType::ModulePostBuildMsg => {
                let (module, msg) = split2(payload)?;
                self.postbuild.entry(module).or_default().push(msg);
                String::new()
            }
            MsgType::AllDone => {
                self.updates_done = true;
                String::new()
            }
            other => bail!("unhandled IPC type mid-stream: {other:?}"),
        };
        Ok(message)
    }

    fn buffer_log_message(&mut self, payload: &str) {
        let mut parts = payload.splitn(4, ',');
        let module = parts.next().unwrap_or("global").to_string();
        let logger = parts.next().unwrap_or("").to_string();
        let level = parts.next().unwrap_or("info").to_string();
        let text = parts.next().unwrap_or("").to_string();
        self.messages
            .entry(module)
            .or_default()
            .push(LogMessage { logger, level, text });
    }
}

fn split2(payload: &str) -> Result<(String, String)> {
    match payload.split_once(',') {
        Some((a, b)) => Ok((a.to_string(), b.to_string())),
        None => bail!("malformed IPC payload \"{payload}\""),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn message_encoding_round_trips() {
        let bytes = encode_message(MsgType::ModuleSuccess, "kcalc,4 commits");
        let (ty, payload) = decode_message(&bytes).expect("decode");
        assert_eq!(ty, MsgType::ModuleSuccess);
        assert_eq!(payload, "kcalc,4 commits");
    }

    #[test]
    fn framing_round_trips_over_a_byte_stream() {
        let mut buf = Vec::new();
        {
            let mut tx = FrameSender::new(&mut buf);
            tx.send(MsgType::AllUpdating, "").expect("send");
            tx.send(MsgType::ModuleSuccess, "a,1 commit").expect("send");
            tx.send(MsgType::AllDone, "").expect("send");
        }
        let mut rx = FrameReceiver::new(&buf[..]);
        assert_eq!(
            rx.recv().expect("recv"),
            Some((MsgType::AllUpdating, String::new()))
        );
        assert_eq!(
            rx.recv().expect("recv"),
            Some((MsgType::ModuleSuccess, "a,1 commit".to_string()))
        );
        assert_eq!(
            rx.recv().expect("recv"),
            Some((MsgType::AllDone, String::new()))
        );
        assert_eq!(rx.recv().expect("recv"), None);
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let mut bytes = encode_message(MsgType::AllDone, "");
        bytes[3] = 200;
        assert!(decode_message(&bytes).is_err());
    }

    fn no_print() -> impl FnMut(&LogMessage) {
        |_msg: &LogMessage| {}
    }

    #[test]
    fn wait_for_module_sees_success_and_commit_count() {
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            ipc.all_updating().expect("send");
            ipc.notify_update_success("kcalc", "4 commits pulled").expect("send");
            ipc.all_done().expect("send");
        }
        let mut state = IpcState::new();
        let mut printer = no_print();
        let (status, msg) = state
            .wait_for_module(&mut queue, "kcalc", true, &mut printer)
            .expect("wait");
        assert_eq!(status, UpdateStatus::Success);
        assert_eq!(msg, "4 commits pulled");
    }

    #[test]
    fn wait_for_module_out_of_order_delivery() {
        // The builder waits on "a" but "b" reports first; both outcomes
        // must be retained.
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            ipc.all_updating().expect("send");
            ipc.notify_update_success("b", "1 commit").expect("send");
            ipc.notify_update_failure("a").expect("send");
            ipc.all_done().expect("send");
        }
        let mut state = IpcState::new();
        let mut printer = no_print();
        let (status_a, _) = state
            .wait_for_module(&mut queue, "a", true, &mut printer)
            .expect("wait");
        assert_eq!(status_a, UpdateStatus::Failed);

        let (status_b, _) = state
            .wait_for_module(&mut queue, "b", true, &mut printer)
            .expect("wait");
        assert_eq!(status_b, UpdateStatus::Success);
    }

    #[test]
    fn uptodate_with_refresh_reason_counts_as_success() {
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            ipc.all_updating().expect("send");
            ipc.notify_uptodate("kcalc", "build dir missing").expect("send");
            ipc.all_done().expect("send");
        }
        let mut state = IpcState::new();
        let mut printer = no_print();
        let (status, msg) = state
            .wait_for_module(&mut queue, "kcalc", true, &mut printer)
            .expect("wait");
        assert_eq!(status, UpdateStatus::Success);
        assert_eq!(msg, "no commits pulled");
        assert_eq!(state.refresh_reason_for("kcalc"), "build dir missing");
    }

    #[test]
    fn uptodate_without_reason_skips_the_build() {
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            ipc.all_updating().expect("send");
            ipc.notify_uptodate("kcalc", "").expect("send");
            ipc.all_done().expect("send");
        }
        let mut state = IpcState::new();
        let mut printer = no_print();
        let (status, _) = state
            .wait_for_module(&mut queue, "kcalc", true, &mut printer)
            .expect("wait");
        assert_eq!(status, UpdateStatus::Skipped);
    }

    #[test]
    fn all_skipped_short_circuits_every_wait() {
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            ipc.all_skipped().expect("send");
        }
        let mut state = IpcState::new();
        let mut printer = no_print();
        let (status, msg) = state
            .wait_for_module(&mut queue, "anything", true, &mut printer)
            .expect("wait");
        assert_eq!(status, UpdateStatus::Success);
        assert_eq!(msg, "Skipped");
        assert!(state.no_update);
    }

    #[test]
    fn all_failure_is_fatal() {
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            ipc.all_failure("network down").expect("send");
        }
        let mut state = IpcState::new();
        let mut printer = no_print();
        let err = state
            .wait_for_module(&mut queue, "kcalc", true, &mut printer)
            .expect_err("must fail");
        assert!(format!("{err:#}").contains("network down"));
    }

    #[test]
    fn log_messages_buffer_until_their_module_is_waited_on() {
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            ipc.all_updating().expect("send");
            ipc.set_logged_module("kcalc");
            ipc.send_log_message("updater", "warn", "fetch was slow").expect("send");
            ipc.notify_update_success("kcalc", "0 commits").expect("send");
            ipc.all_done().expect("send");
        }
        let mut state = IpcState::new();
        let mut seen = Vec::new();
        let mut printer = |msg: &LogMessage| seen.push(msg.clone());
        state
            .wait_for_module(&mut queue, "kcalc", true, &mut printer)
            .expect("wait");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, "warn");
        assert_eq!(seen[0].text, "fetch was slow");
    }

    #[test]
    fn persist_writes_are_collected_for_the_parent() {
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            ipc.all_updating().expect("send");
            ipc.notify_persistent_option_change("kcalc", "git-cloned-repository", "kde:kcalc.git")
                .expect("send");
            ipc.notify_update_success("kcalc", "cloned").expect("send");
            ipc.all_done().expect("send");
        }
        let mut state = IpcState::new();
        let mut printer = no_print();
        state
            .wait_for_module(&mut queue, "kcalc", true, &mut printer)
            .expect("wait");
        assert_eq!(
            state.persist_writes,
            vec![PersistWrite {
                module: "kcalc".into(),
                key: "git-cloned-repository".into(),
                value: "kde:kcalc.git".into(),
            }]
        );
    }

    #[test]
    fn post_build_messages_are_retained_per_module() {
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            ipc.all_updating().expect("send");
            ipc.notify_post_build_message("kcalc", "stash could not be reapplied")
                .expect("send");
            ipc.notify_update_success("kcalc", "1 commit").expect("send");
            ipc.all_done().expect("send");
        }
        let mut state = IpcState::new();
        let mut printer = no_print();
        state
            .wait_for_module(&mut queue, "kcalc", true, &mut printer)
            .expect("wait");
        assert_eq!(
            state.take_post_build_messages("kcalc"),
            vec!["stash could not be reapplied".to_string()]
        );
        assert!(state.take_post_build_messages("kcalc").is_empty());
    }

    #[test]
    fn update_phase_absent_reports_skipped_success() {
        let mut queue = LocalQueue::new();
        {
            let mut ipc = UpdaterIpc::new(&mut queue);
            ipc.all_updating().expect("send");
        }
        let mut state = IpcState::new();
        let mut printer = no_print();
        let (status, msg) = state
            .wait_for_module(&mut queue, "kcalc", false, &mut printer)
            .expect("wait");
        assert_eq!(status, UpdateStatus::Success);
        assert_eq!(msg, "Skipped");
    }

    proptest! {
        // Frames survive arbitrary payload content, including commas and
        // newlines, end to end.
        #[test]
        fn arbitrary_payload_frames_round_trip(payload in "[ -~\n]{0,200}") {
            let mut buf = Vec::new();
            {
                let mut tx = FrameSender::new(&mut buf);
                tx.send(MsgType::ModuleLogMsg, &payload).expect("send");
            }
            let mut rx = FrameReceiver::new(&buf[..]);
            let (ty, got) = rx.recv().expect("recv").expect("frame");
            prop_assert_eq!(ty, MsgType::ModuleLogMsg);
            prop_assert_eq!(got, payload);
        }

        // Per-module ordering survives interleaving with other modules.
        #[test]
        fn per_module_order_is_preserved(seq in prop::collection::vec(0u8..3, 1..20)) {
            let mut queue = LocalQueue::new();
            {
                let mut ipc = UpdaterIpc::new(&mut queue);
                ipc.all_updating().expect("send");
                for (i, m) in seq.iter().enumerate() {
                    ipc.notify_post_build_message(&format!("m{m}"), &format!("event-{i}"))
                        .expect("send");
                }
                for m in 0..3u8 {
                    ipc.notify_update_success(&format!("m{m}"), "ok").expect("send");
                }
                ipc.all_done().expect("send");
            }
            let mut state = IpcState::new();
            let mut printer = |_: &LogMessage| {};
            for m in 0..3u8 {
                state
                    .wait_for_module(&mut queue, &format!("m{m}"), true, &mut printer)
                    .expect("wait");
            }
            for m in 0..3u8 {
                let msgs = state.take_post_build_messages(&format!("m{m}"));
                let expected: Vec<String> = seq
                    .iter()
                    .enumerate()
                    .filter(|(_, mm)| **mm == m)
                    .map(|(i, _)| format!("event-{i}"))
                    .collect();
                prop_assert_eq!(msgs, expected);
            }
        }
    }
}
