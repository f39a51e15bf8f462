//! Scriptable RemoteEx server for the integration tests.
//!
//! Listens on two adjacent localhost ports, sends the greetings and answers
//! commands from a small table of device and camera parameters. Replies can
//! be overridden per command, unsolicited messages pushed at any time.

#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use daq_driver_hamamatsu::protocol::{CMD_GREETING, DATA_GREETING};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Full sensor width and height of the emulated readout camera.
pub const SENSOR_PIXELS: u32 = 2048;

/// Reply override for one occurrence of a command.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Raw text written on the command socket, terminators included.
    Raw(String),
    /// Reply with a status code and fields.
    Status(i32, Vec<String>),
    /// No reply at all.
    Silent,
}

/// Image held in the emulated ring buffer.
#[derive(Debug, Clone)]
pub struct MockImage {
    pub width: u32,
    pub height: u32,
    pub sequence: String,
    pub pixels: Vec<u16>,
    /// Pixels actually written on the data socket; all when `None`.
    pub sent_pixels: Option<usize>,
}

impl MockImage {
    /// `width` x `height` image whose pixel `i` has value `i`.
    pub fn ramp(width: u32, height: u32, sequence: &str) -> Self {
        Self {
            width,
            height,
            sequence: sequence.to_string(),
            pixels: (0..width * height).map(|i| i as u16).collect(),
            sent_pixels: None,
        }
    }

    /// Like [`MockImage::ramp`], but only the first `sent` pixels reach the
    /// data socket.
    pub fn truncated(width: u32, height: u32, sequence: &str, sent: usize) -> Self {
        Self {
            sent_pixels: Some(sent),
            ..Self::ramp(width, height, sequence)
        }
    }
}

type Key = (String, String);

#[derive(Default)]
struct MockState {
    version: String,
    dev: HashMap<Key, String>,
    dev_info: HashMap<Key, Vec<String>>,
    dev_lists: HashMap<String, Vec<String>>,
    cam: HashMap<Key, String>,
    cam_info: HashMap<Key, Vec<String>>,
    cam_lists: HashMap<String, Vec<String>>,
    scripts: HashMap<String, VecDeque<Scripted>>,
    images: Vec<MockImage>,
    announce: VecDeque<String>,
    scaling_table: Vec<f32>,
    received: Vec<String>,
}

#[derive(Default)]
struct Output {
    command: Vec<u8>,
    data: Vec<u8>,
}

impl Output {
    fn reply(&mut self, code: i32, name: &str, fields: &[&str]) {
        let text = format!("{},{},{}\r", code, name, fields.join(","));
        self.command.extend_from_slice(text.as_bytes());
    }
}

fn key(location: &str, name: &str) -> Key {
    (location.to_string(), name.to_string())
}

fn parse_request(text: &str) -> (String, Vec<String>) {
    match text.split_once('(') {
        Some((name, rest)) => {
            let inner = rest.strip_suffix(')').unwrap_or(rest);
            let args = if inner.is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(str::to_string).collect()
            };
            (name.to_string(), args)
        }
        None => (text.to_string(), Vec::new()),
    }
}

impl MockState {
    fn handle(&mut self, text: &str) -> Output {
        self.received.push(text.to_string());
        let (name, args) = parse_request(text);
        let mut out = Output::default();

        if let Some(script) = self.scripts.get_mut(&name).and_then(VecDeque::pop_front) {
            match script {
                Scripted::Raw(raw) => out.command.extend_from_slice(raw.as_bytes()),
                Scripted::Status(code, fields) => {
                    let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
                    out.reply(code, &name, &fields);
                }
                Scripted::Silent => {}
            }
            return out;
        }

        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        match name.as_str() {
            "AppStart" | "AppEnd" | "AcqStop" | "acqLiveMonitor" => out.reply(0, &name, &[]),
            "AppLicenceGet" => out.reply(0, &name, &["1", "1"]),
            "AppInfo" => out.reply(0, &name, &[self.version.as_str()]),
            "AsyncCommandStatus" => out.reply(0, &name, &["0", "0", "0"]),
            "DevParamGet" => match self.dev.get(&key(&arg(0), &arg(1))) {
                Some(value) => out.reply(0, &name, &[value.as_str()]),
                None => out.reply(2, &name, &[]),
            },
            "DevParamSet" => {
                let value = args.get(2..).map(|v| v.join(",")).unwrap_or_default();
                self.dev.insert(key(&arg(0), &arg(1)), value);
                out.reply(0, &name, &[]);
            }
            "DevParamInfoEx" => match self.dev_info.get(&key(&arg(0), &arg(1))) {
                Some(info) => {
                    let fields: Vec<&str> = info.iter().map(String::as_str).collect();
                    out.reply(0, &name, &fields);
                }
                None => out.reply(2, &name, &[]),
            },
            "DevParamsList" => {
                let list = self.dev_lists.get(&arg(0)).cloned().unwrap_or_default();
                let fields: Vec<&str> = list.iter().map(String::as_str).collect();
                out.reply(0, &name, &fields);
            }
            "CamParamGet" => match self.cam.get(&key(&arg(0), &arg(1))) {
                Some(value) => out.reply(0, &name, &[value.as_str()]),
                None => out.reply(2, &name, &[]),
            },
            "CamParamSet" => {
                let value = args.get(2..).map(|v| v.join(",")).unwrap_or_default();
                if arg(0) == "Setup" && arg(1) == "Binning" {
                    self.apply_binning(&value);
                }
                self.cam.insert(key(&arg(0), &arg(1)), value);
                out.reply(0, &name, &[]);
            }
            "CamParamInfoEx" => match self.cam_info.get(&key(&arg(0), &arg(1))) {
                Some(info) => {
                    let fields: Vec<&str> = info.iter().map(String::as_str).collect();
                    out.reply(0, &name, &fields);
                }
                None => out.reply(2, &name, &[]),
            },
            "CamParamsList" => {
                let list = self.cam_lists.get(&arg(0)).cloned().unwrap_or_default();
                let fields: Vec<&str> = list.iter().map(String::as_str).collect();
                out.reply(0, &name, &fields);
            }
            "AcqStart" => {
                out.reply(0, &name, &[]);
                if let Some(sequence) = self.announce.pop_front() {
                    let notification = format!("4,Livemonitor,RingBuffer,{sequence}\r");
                    out.command.extend_from_slice(notification.as_bytes());
                }
            }
            "ImgRingBufferGet" => {
                let sequence = arg(1);
                match self.images.iter().find(|img| img.sequence == sequence) {
                    Some(img) => {
                        let (width, height) = (img.width.to_string(), img.height.to_string());
                        out.reply(
                            0,
                            &name,
                            &[
                                width.as_str(),
                                height.as_str(),
                                "2",
                                "2",
                                img.sequence.as_str(),
                                "12:00:00.000",
                            ],
                        );
                        let sent = img.sent_pixels.unwrap_or(img.pixels.len());
                        for pixel in img.pixels.iter().take(sent) {
                            out.data.extend_from_slice(&pixel.to_le_bytes());
                        }
                    }
                    None => out.reply(0, &name, &[]),
                }
            }
            "ImgDataGet" => {
                let count = self.scaling_table.len().to_string();
                out.reply(0, &name, &[count.as_str(), "1"]);
                for value in &self.scaling_table {
                    out.data.extend_from_slice(&value.to_le_bytes());
                }
            }
            _ => out.reply(2, &name, &[]),
        }
        out
    }

    fn apply_binning(&mut self, value: &str) {
        let Some((h, v)) = value.split_once('x') else {
            return;
        };
        if let (Ok(h), Ok(v)) = (h.trim().parse::<u32>(), v.trim().parse::<u32>()) {
            if h > 0 && v > 0 {
                self.cam
                    .insert(key("Setup", "HWidth"), (SENSOR_PIXELS / h).to_string());
                self.cam
                    .insert(key("Setup", "VWidth"), (SENSOR_PIXELS / v).to_string());
            }
        }
    }
}

/// Emulated RemoteEx server.
pub struct MockRemoteEx {
    port: u16,
    state: Arc<Mutex<MockState>>,
    push: mpsc::UnboundedSender<String>,
    hang_up: Arc<Notify>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Drop for MockRemoteEx {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn adjacent_listeners() -> (TcpListener, TcpListener, u16) {
    loop {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = first.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if let Ok(second) = TcpListener::bind(("127.0.0.1", port + 1)).await {
            return (first, second, port);
        }
    }
}

impl MockRemoteEx {
    /// Server with an empty parameter table.
    pub async fn start() -> Self {
        let (cmd, data, port) = adjacent_listeners().await;
        let state = Arc::new(Mutex::new(MockState {
            version: "9.5 pf12".to_string(),
            ..MockState::default()
        }));
        let (push, push_rx) = mpsc::unbounded_channel();
        let hang_up = Arc::new(Notify::new());
        let connections = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(serve(
            Listeners { cmd, data },
            state.clone(),
            push_rx,
            hang_up.clone(),
            connections.clone(),
        ));
        Self {
            port,
            state,
            push,
            hang_up,
            connections,
            task,
        }
    }

    /// Server emulating a single-sweep streak unit, a DG645 delay generator
    /// and an OrcaFlash readout camera.
    pub async fn streak_system() -> Self {
        let mock = Self::start().await;

        mock.set_dev_list(
            "Streakcamera",
            &[
                "Time Range",
                "Mode",
                "Gate Mode",
                "MCP Gain",
                "Shutter",
                "Trig. Mode",
                "Trig. level",
                "Trig. slope",
            ],
        );
        mock.set_dev("Streakcamera", "DeviceName", "C10910");
        mock.set_dev("Streakcamera", "Time Range", "1 ns");
        mock.set_dev("Streakcamera", "Mode", "Operate");
        mock.set_dev("Streakcamera", "MCP Gain", "12");
        mock.set_dev("Streakcamera", "Shutter", "Open");
        mock.set_dev_info(
            "Streakcamera",
            "MCP Gain",
            &["MCP Gain", "12", "2", "0", "1", "0", "63"],
        );
        mock.set_dev_info(
            "Streakcamera",
            "Time Range",
            &[
                "Time Range", "1 ns", "5", "0", "0", "5", "1 ns", "5 ns", "1 us", "500 us", "1 ms",
            ],
        );

        mock.set_dev_list(
            "Delaybox",
            &[
                "Setting",
                "Trig. Mode",
                "Repetition Rate",
                "Delay A",
                "Delay B",
                "Burst Mode",
            ],
        );
        mock.set_dev("Delaybox", "DeviceName", "DG645");
        mock.set_dev("Delaybox", "Repetition Rate", "1000");
        mock.set_dev("Delaybox", "Delay A", "0.5");
        mock.set_dev("Delaybox", "Delay B", "0");
        mock.set_dev_info("Delaybox", "Delay A", &["Delay A", "0", "1", "0", "0", "10"]);
        mock.set_dev_info("Delaybox", "Delay B", &["Delay B", "0", "1", "0", "0", "10"]);

        mock.set_cam_list(
            "Setup",
            &[
                "TimingMode",
                "ShowGainOffset",
                "ScanMode",
                "Binning",
                "HWidth",
                "VWidth",
                "HOffs",
                "VOffs",
                "CameraInfo",
            ],
        );
        mock.set_cam(
            "Setup",
            "CameraInfo",
            "OrcaFlash 4.0 V3\r\nProduct number: C13440-20C\r\nSerial number: 301730\r\n\
             Firmware: 4.20.B\r\nVersion: 4.20.B03",
        );
        mock.set_cam("Setup", "Binning", "1 x 1");
        mock.set_cam("Setup", "HWidth", "2048");
        mock.set_cam("Setup", "VWidth", "2048");
        mock.set_cam("Setup", "HOffs", "0");
        mock.set_cam("Setup", "VOffs", "0");
        mock.set_cam_info(
            "Setup",
            "Binning",
            &["Binning", "1 x 1", "1", "0", "1 x 1", "2 x 2", "4 x 4"],
        );
        mock.set_cam("Live", "Exposure", "100 ms");
        mock.set_cam_info("Live", "Exposure", &["Exposure", "100 ms", "1", "0", "1 ms", "10 s"]);
        mock
    }

    /// Command port; the data port is one above.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_version(&self, version: &str) {
        self.state.lock().version = version.to_string();
    }

    pub fn set_dev(&self, location: &str, name: &str, value: &str) {
        self.state
            .lock()
            .dev
            .insert(key(location, name), value.to_string());
    }

    pub fn dev(&self, location: &str, name: &str) -> Option<String> {
        self.state.lock().dev.get(&key(location, name)).cloned()
    }

    pub fn set_dev_info(&self, location: &str, name: &str, fields: &[&str]) {
        self.state.lock().dev_info.insert(
            key(location, name),
            fields.iter().map(|f| f.to_string()).collect(),
        );
    }

    pub fn set_dev_list(&self, location: &str, names: &[&str]) {
        self.state.lock().dev_lists.insert(
            location.to_string(),
            names.iter().map(|n| n.to_string()).collect(),
        );
    }

    pub fn set_cam(&self, location: &str, name: &str, value: &str) {
        self.state
            .lock()
            .cam
            .insert(key(location, name), value.to_string());
    }

    pub fn cam(&self, location: &str, name: &str) -> Option<String> {
        self.state.lock().cam.get(&key(location, name)).cloned()
    }

    pub fn set_cam_info(&self, location: &str, name: &str, fields: &[&str]) {
        self.state.lock().cam_info.insert(
            key(location, name),
            fields.iter().map(|f| f.to_string()).collect(),
        );
    }

    pub fn set_cam_list(&self, location: &str, names: &[&str]) {
        self.state.lock().cam_lists.insert(
            location.to_string(),
            names.iter().map(|n| n.to_string()).collect(),
        );
    }

    /// Override the next replies to `command`, in order.
    pub fn script(&self, command: &str, replies: impl IntoIterator<Item = Scripted>) {
        self.state
            .lock()
            .scripts
            .entry(command.to_string())
            .or_default()
            .extend(replies);
    }

    /// Put an image in the ring buffer.
    pub fn add_image(&self, image: MockImage) {
        self.state.lock().images.push(image);
    }

    /// Announce `sequence` with a `Livemonitor` message after the next `AcqStart`.
    pub fn announce_on_start(&self, sequence: &str) {
        self.state.lock().announce.push_back(sequence.to_string());
    }

    pub fn set_scaling_table(&self, table: Vec<f32>) {
        self.state.lock().scaling_table = table;
    }

    /// Write raw text on the command socket.
    pub fn push(&self, raw: &str) {
        self.push.send(raw.to_string()).unwrap();
    }

    /// Close both sockets of the current session. The server keeps
    /// accepting new connections.
    pub fn hang_up(&self) {
        self.hang_up.notify_one();
    }

    /// Sessions accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every command received so far, without terminator.
    pub fn received(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    /// Number of received commands named `command`.
    pub fn count(&self, command: &str) -> usize {
        let prefix = format!("{command}(");
        self.state
            .lock()
            .received
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }
}

struct Listeners {
    cmd: TcpListener,
    data: TcpListener,
}

async fn serve(
    listeners: Listeners,
    state: Arc<Mutex<MockState>>,
    mut push_rx: mpsc::UnboundedReceiver<String>,
    hang_up: Arc<Notify>,
    connections: Arc<AtomicUsize>,
) {
    loop {
        let Ok((mut cmd_stream, _)) = listeners.cmd.accept().await else {
            return;
        };
        let Ok((mut data_stream, _)) = listeners.data.accept().await else {
            return;
        };
        if cmd_stream.write_all(CMD_GREETING).await.is_err()
            || data_stream.write_all(DATA_GREETING).await.is_err()
        {
            continue;
        }
        connections.fetch_add(1, Ordering::SeqCst);
        session(
            &mut cmd_stream,
            &mut data_stream,
            &state,
            &mut push_rx,
            &hang_up,
        )
        .await;
    }
}

async fn session(
    cmd: &mut TcpStream,
    data: &mut TcpStream,
    state: &Mutex<MockState>,
    push_rx: &mut mpsc::UnboundedReceiver<String>,
    hang_up: &Notify,
) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            read = cmd.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&buf[..n]);
                while let Some(end) = pending.iter().position(|&b| b == b'\r') {
                    let line: Vec<u8> = pending.drain(..=end).collect();
                    let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                    let output = state.lock().handle(&text);
                    if cmd.write_all(&output.command).await.is_err()
                        || data.write_all(&output.data).await.is_err()
                    {
                        return;
                    }
                }
            }
            Some(raw) = push_rx.recv() => {
                if cmd.write_all(raw.as_bytes()).await.is_err() {
                    return;
                }
            }
            _ = hang_up.notified() => return,
        }
    }
}

/// Poll `condition` every 10 ms for up to 5 s.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
