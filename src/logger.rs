//! Rate-paced acquisition logging.
//!
//! The logger runs on its own OS thread with a current-thread runtime so it
//! may block on the persistence sink without stalling interactive callers.
//! Each tick it snapshots every registered device through the coordinator,
//! stamps each row with the midpoint of the request/response instants, and
//! forwards the rows to the [Sink].
//!
//! A side-channel command queue lets callers run ad-hoc coordinator reads
//! and writes between samples without sharing the transports concurrently.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use indexmap::IndexMap;
use log::warn;

use crate::daq::{Daq, REQUEST_SENT_KEY, RESPONSE_RECEIVED_KEY};
use crate::logging::{DAQ_LOG_PREFIX, LogLevel};
use crate::schema::{DataFrame, Value};
use crate::{Error, Result};

/// Persistence table name.
pub const TABLE: &str = "alicat";

/// Fallback run length when no duration is configured (a little over a
/// week).
pub const DEFAULT_DURATION: Duration = Duration::from_secs(610_000);

/// Positional SQL parameter for [Sink::execute].
#[derive(Clone, Debug, PartialEq)]
pub enum SqlParam {
    Float(f64),
    Text(String),
    Timestamp(SystemTime),
    Null,
}

impl From<&Value> for SqlParam {
    fn from(value: &Value) -> Self {
        match value {
            Value::Decimal(v) => Self::Float(*v),
            Value::Text(s) => Self::Text(s.clone()),
            Value::Timestamp(t) => Self::Timestamp(*t),
            Value::None => Self::Null,
        }
    }
}

/// The persistence sink contract.
///
/// An async transaction-capable connection taking one statement at a time
/// with positional `$1, $2, …` parameters. The logger never inspects
/// results beyond success.
#[async_trait]
pub trait Sink: Send {
    async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64>;
}

/// Inbound side-channel commands.
pub enum LogCommand {
    /// Terminate the run.
    Stop,
    /// Run a coordinator read between samples.
    Get { stats: Vec<String>, ids: Vec<String> },
    /// Run a coordinator write between samples.
    Set {
        commands: IndexMap<String, Vec<String>>,
        ids: Vec<String>,
    },
}

/// Outbound side-channel replies.
pub type LogReply = Result<IndexMap<String, DataFrame>>;

/// Logger run parameters.
#[derive(Clone, Debug)]
pub struct LoggerConfig {
    /// Statistic names passed to every coordinator read.
    pub stats: Vec<String>,
    /// Acquisition rate in Hz. Instruments top out around 50 Hz.
    pub rate_hz: f64,
    /// Run length; unlimited (a week-plus fallback) when unset.
    pub duration: Option<Duration>,
    /// When set, the previous tick's rows persist in parallel with this
    /// tick's sample, with at most one batch pending.
    pub write_async: bool,
    /// Verbosity ceiling applied to the process-wide logger when the run
    /// starts; leave unset to keep the current ceiling.
    pub log_level: Option<LogLevel>,
}

impl LoggerConfig {
    pub fn new(stats: Vec<String>, rate_hz: f64) -> Self {
        Self {
            stats,
            rate_hz,
            duration: None,
            write_async: false,
            log_level: None,
        }
    }
}

/// Control handle for a running logger worker.
#[derive(Debug)]
pub struct LoggerHandle {
    commands: mpsc::Sender<LogCommand>,
    replies: mpsc::Receiver<LogReply>,
    worker: thread::JoinHandle<Result<u64>>,
}

impl LoggerHandle {
    /// Requests termination and waits for the worker.
    ///
    /// Returns the number of rows persisted.
    pub fn stop(self) -> Result<u64> {
        // The worker may already have finished on its own.
        let _ = self.commands.send(LogCommand::Stop);
        self.join()
    }

    /// Waits for the configured duration to elapse.
    pub fn wait(self) -> Result<u64> {
        self.join()
    }

    fn join(self) -> Result<u64> {
        self.worker
            .join()
            .map_err(|_| Error::failure("logger worker panicked"))?
    }

    /// Runs a coordinator read between samples and waits for the reply.
    pub fn get(&self, stats: Vec<String>, ids: Vec<String>) -> LogReply {
        self.commands.send(LogCommand::Get { stats, ids })?;
        self.recv_reply()
    }

    /// Runs a coordinator write between samples and waits for the reply.
    pub fn set(&self, commands: IndexMap<String, Vec<String>>, ids: Vec<String>) -> LogReply {
        self.commands.send(LogCommand::Set { commands, ids })?;
        self.recv_reply()
    }

    fn recv_reply(&self) -> LogReply {
        self.replies
            .recv()
            .map_err(|_| Error::failure("logger worker ended before replying"))?
    }
}

/// Starts the logging worker on its own OS thread.
pub fn start(daq: Arc<Daq>, sink: Box<dyn Sink>, config: LoggerConfig) -> Result<LoggerHandle> {
    if !config.rate_hz.is_finite() || config.rate_hz <= 0.0 {
        return Err(Error::invalid_argument(format!(
            "acquisition rate must be positive, have: {}",
            config.rate_hz
        )));
    }

    if let Some(level) = config.log_level {
        log::set_max_level(level.into());
    }

    let (command_tx, command_rx) = mpsc::channel();
    let (reply_tx, reply_rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| Error::failure(format!("logger runtime: {err}")))?;

        runtime.block_on(run(daq.as_ref(), sink, config, command_rx, reply_tx))
    });

    Ok(LoggerHandle {
        commands: command_tx,
        replies: reply_rx,
        worker,
    })
}

/// One row bound for the sink, in display-name column order.
struct Row {
    columns: Vec<String>,
    params: Vec<SqlParam>,
}

async fn run(
    daq: &Daq,
    mut sink: Box<dyn Sink>,
    config: LoggerConfig,
    commands: mpsc::Receiver<LogCommand>,
    replies: mpsc::Sender<LogReply>,
) -> Result<u64> {
    let period = Duration::from_secs_f64(1.0 / config.rate_hz);
    let duration = config.duration.unwrap_or(DEFAULT_DURATION);
    let stats: Vec<&str> = config.stats.iter().map(String::as_str).collect();

    // Bootstrap read: learns the per-device reply shape, which fixes the
    // persistence schema for the whole run.
    let bootstrap = daq.get(&stats, &[]).await?;
    let mut union = DataFrame::new();

    for frame in bootstrap.values() {
        for (key, value) in frame {
            union.insert(key.clone(), value.clone());
        }
    }

    create_table(sink.as_mut(), &union).await?;

    let start = Instant::now();
    let mut reps: u64 = 0;
    let mut rows_written: u64 = 0;
    let mut pending: Vec<Row> = Vec::new();

    loop {
        if start.elapsed() >= duration {
            break;
        }

        match commands.try_recv() {
            Ok(LogCommand::Stop) => break,
            Ok(LogCommand::Get { stats, ids }) => {
                let stats: Vec<&str> = stats.iter().map(String::as_str).collect();
                let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

                if replies.send(daq.get(&stats, &ids).await).is_err() {
                    warn!("{DAQ_LOG_PREFIX}: side-channel caller went away");
                }

                continue;
            }
            Ok(LogCommand::Set { commands, ids }) => {
                let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

                if replies.send(daq.set(&commands, &ids).await).is_err() {
                    warn!("{DAQ_LOG_PREFIX}: side-channel caller went away");
                }

                continue;
            }
            Err(mpsc::TryRecvError::Empty) => {}
            Err(mpsc::TryRecvError::Disconnected) => break,
        }

        let due = period.mul_f64(reps as f64);

        if start.elapsed() < due {
            let wait = due - start.elapsed();
            tokio::time::sleep(wait.min(Duration::from_millis(5))).await;
            continue;
        }

        if config.write_async {
            let (inserted, sampled) =
                tokio::join!(insert_rows(sink.as_mut(), &pending), daq.get(&stats, &[]));

            inserted?;
            rows_written += pending.len() as u64;
            pending.clear();

            match sampled {
                Ok(frames) => pending = build_rows(&frames),
                Err(err) if err.is_timeout() => {
                    warn!("{DAQ_LOG_PREFIX}: sample {reps} timed out: {err}");
                }
                Err(err) => return Err(err),
            }
        } else {
            match daq.get(&stats, &[]).await {
                Ok(frames) => {
                    let rows = build_rows(&frames);
                    insert_rows(sink.as_mut(), &rows).await?;
                    rows_written += rows.len() as u64;
                }
                Err(err) if err.is_timeout() => {
                    warn!("{DAQ_LOG_PREFIX}: sample {reps} timed out: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        reps += 1;

        // An elapsed overshoot of a full period or more advances past the
        // missed ticks instead of bursting to catch up.
        while start.elapsed().as_secs_f64() >= period.as_secs_f64() * (reps + 1) as f64 {
            reps += 1;
            warn!("{DAQ_LOG_PREFIX}: sampling overrun, advancing past missed tick {reps}");
        }
    }

    if !pending.is_empty() {
        insert_rows(sink.as_mut(), &pending).await?;
        rows_written += pending.len() as u64;
    }

    Ok(rows_written)
}

/// Creates the table and one column per observed key.
///
/// Column creation order uses a synthetic sort key so the timestamp
/// annotations and the unit id lead the schema.
async fn create_table(sink: &mut dyn Sink, union: &DataFrame) -> Result<()> {
    sink.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (Time timestamp, Device text, PRIMARY KEY (Time, Device))"
        ),
        &[],
    )
    .await?;

    let mut keys: Vec<&String> = union.keys().collect();
    keys.sort_by_key(|key| sort_key(key));

    for key in keys {
        let data_type = if key.as_str() == REQUEST_SENT_KEY || key.as_str() == RESPONSE_RECEIVED_KEY
        {
            "timestamp"
        } else if matches!(union[key.as_str()], Value::Decimal(_)) {
            "float"
        } else {
            "text"
        };

        sink.execute(
            &format!(
                "ALTER TABLE {TABLE} ADD COLUMN IF NOT EXISTS {} {data_type}",
                column_name(key)
            ),
            &[],
        )
        .await?;
    }

    // Best-effort: not every backend has timescale installed.
    if let Err(err) = sink
        .execute(
            &format!("SELECT create_hypertable('{TABLE}', by_range('time'), if_not_exists => TRUE)"),
            &[],
        )
        .await
    {
        warn!("{DAQ_LOG_PREFIX}: hypertable registration unavailable: {err}");
    }

    Ok(())
}

fn sort_key(key: &str) -> String {
    if key == REQUEST_SENT_KEY {
        return "\u{0}".to_string();
    }

    if key == RESPONSE_RECEIVED_KEY {
        return "\u{1}".to_string();
    }

    if key.eq_ignore_ascii_case("unit_id") {
        return "\u{2}".to_string();
    }

    key.to_string()
}

/// Statistic name to SQL column: whitespace removed, lower-cased.
fn column_name(key: &str) -> String {
    key.split_whitespace().collect::<String>().to_lowercase()
}

/// A row's `Time` is the midpoint of the request/response instants.
fn row_time(frame: &DataFrame) -> SystemTime {
    match (frame.get(REQUEST_SENT_KEY), frame.get(RESPONSE_RECEIVED_KEY)) {
        (Some(Value::Timestamp(sent)), Some(Value::Timestamp(received))) => {
            *sent + received.duration_since(*sent).unwrap_or_default() / 2
        }
        _ => SystemTime::now(),
    }
}

fn build_rows(frames: &IndexMap<String, DataFrame>) -> Vec<Row> {
    frames
        .iter()
        .map(|(device, frame)| {
            let mut columns = vec![
                "Time".to_string(),
                "Device".to_string(),
                REQUEST_SENT_KEY.to_string(),
                RESPONSE_RECEIVED_KEY.to_string(),
            ];
            let mut params = vec![
                SqlParam::Timestamp(row_time(frame)),
                SqlParam::Text(device.clone()),
                frame
                    .get(REQUEST_SENT_KEY)
                    .map(SqlParam::from)
                    .unwrap_or(SqlParam::Null),
                frame
                    .get(RESPONSE_RECEIVED_KEY)
                    .map(SqlParam::from)
                    .unwrap_or(SqlParam::Null),
            ];

            for (key, value) in frame {
                if key == REQUEST_SENT_KEY || key == RESPONSE_RECEIVED_KEY {
                    continue;
                }

                columns.push(key.clone());
                params.push(SqlParam::from(value));
            }

            Row { columns, params }
        })
        .collect()
}

async fn insert_rows(sink: &mut dyn Sink, rows: &[Row]) -> Result<()> {
    for row in rows {
        let columns: Vec<String> = row.columns.iter().map(|key| column_name(key)).collect();
        let placeholders: Vec<String> = (1..=row.params.len()).map(|i| format!("${i}")).collect();

        sink.execute(
            &format!(
                "INSERT INTO {TABLE} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            ),
            &row.params,
        )
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::DeviceSource;
    use crate::tests::{init_logger, mock_device, reply};

    #[derive(Clone, Default)]
    struct MemSink {
        statements: Arc<std::sync::Mutex<Vec<(String, Vec<SqlParam>)>>>,
    }

    impl MemSink {
        fn log(&self) -> Arc<std::sync::Mutex<Vec<(String, Vec<SqlParam>)>>> {
            Arc::clone(&self.statements)
        }
    }

    #[async_trait]
    impl Sink for MemSink {
        async fn execute(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64> {
            self.statements
                .lock()
                .expect("statement log")
                .push((sql.to_string(), params.to_vec()));
            Ok(1)
        }
    }

    async fn two_device_daq() -> Arc<Daq> {
        let responses = vec![reply(&["A 0.0"]); 64];
        let (alpha, _) = mock_device("MC-500SCCM-D", "GP05 10v05.0", responses.clone()).await;
        let (beta, _) = mock_device("M-500SCCM-D", "GP05 10v05.0", responses).await;

        let mut sources = IndexMap::new();
        sources.insert("alpha".to_string(), DeviceSource::from(alpha));
        sources.insert("beta".to_string(), DeviceSource::from(beta));

        Arc::new(Daq::init(sources).await.expect("registry init"))
    }

    #[test]
    fn test_sql_param_from_value() {
        assert_eq!(SqlParam::from(&Value::Decimal(1.5)), SqlParam::Float(1.5));
        assert_eq!(
            SqlParam::from(&Value::Text("Air".into())),
            SqlParam::Text("Air".into())
        );
        assert_eq!(SqlParam::from(&Value::None), SqlParam::Null);
    }

    #[test]
    fn test_column_name() {
        assert_eq!(column_name("Request Sent"), "requestsent");
        assert_eq!(column_name("Mass_Flow"), "mass_flow");
        assert_eq!(column_name("Device"), "device");
    }

    #[test]
    fn test_sort_key_fronts_annotations() {
        let mut keys = vec!["Mass_Flow", "unit_id", "Response Received", "Request Sent"];
        keys.sort_by_key(|key| sort_key(key));
        assert_eq!(
            keys,
            ["Request Sent", "Response Received", "unit_id", "Mass_Flow"]
        );
    }

    #[test]
    fn test_start_rejects_bad_rate() {
        let daq = Arc::new(Daq::new());
        let err = start(
            daq,
            Box::new(MemSink::default()),
            LoggerConfig::new(vec![], 0.0),
        )
        .expect_err("zero rate");
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgument);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_logger_schema_and_rows() -> Result<()> {
        init_logger();

        let daq = two_device_daq().await;
        let sink = MemSink::default();
        let log = sink.log();

        let mut config = LoggerConfig::new(vec!["Mass_Flow".to_string()], 10.0);
        config.duration = Some(Duration::from_millis(350));
        config.log_level = Some(LogLevel::Debug);

        let handle = start(daq, Box::new(sink), config)?;
        assert_eq!(log::max_level(), log::LevelFilter::Debug);

        let written = tokio::task::spawn_blocking(move || handle.wait())
            .await
            .expect("worker join")?;

        let statements = log.lock().expect("statement log");

        // Table creation, then one column per key with the annotations
        // fronted, then the best-effort hypertable registration.
        assert!(statements[0].0.starts_with("CREATE TABLE IF NOT EXISTS alicat"));
        assert!(statements[1]
            .0
            .starts_with("ALTER TABLE alicat ADD COLUMN IF NOT EXISTS requestsent timestamp"));
        assert!(statements[2]
            .0
            .starts_with("ALTER TABLE alicat ADD COLUMN IF NOT EXISTS responsereceived timestamp"));
        assert!(statements[3]
            .0
            .starts_with("ALTER TABLE alicat ADD COLUMN IF NOT EXISTS mass_flow float"));
        assert!(statements[4].0.starts_with("SELECT create_hypertable"));

        let inserts: Vec<_> = statements
            .iter()
            .filter(|(sql, _)| sql.starts_with("INSERT INTO alicat"))
            .collect();

        assert_eq!(inserts.len() as u64, written);

        // Two devices per tick; 350 ms at 10 Hz is ticks 0..=3, give or
        // take scheduling.
        assert_eq!(inserts.len() % 2, 0);
        assert!((4..=10).contains(&inserts.len()), "have: {}", inserts.len());

        let (sql, params) = inserts[0];
        assert_eq!(
            sql.as_str(),
            "INSERT INTO alicat (time, device, requestsent, responsereceived, mass_flow) \
             VALUES ($1, $2, $3, $4, $5)"
        );

        let (SqlParam::Timestamp(time), SqlParam::Timestamp(sent), SqlParam::Timestamp(received)) =
            (&params[0], &params[2], &params[3])
        else {
            panic!("timestamp params expected, have: {params:?}");
        };
        assert!(sent <= time && time <= received);
        assert_eq!(params[1], SqlParam::Text("alpha".into()));
        assert_eq!(params[4], SqlParam::Float(0.0));

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_logger_stop_message() -> Result<()> {
        init_logger();

        let daq = two_device_daq().await;
        let sink = MemSink::default();

        let handle = start(
            daq,
            Box::new(sink),
            LoggerConfig::new(vec!["Mass_Flow".to_string()], 5.0),
        )?;

        tokio::time::sleep(Duration::from_millis(150)).await;

        let written = tokio::task::spawn_blocking(move || handle.stop())
            .await
            .expect("worker join")?;
        assert!(written >= 2, "have: {written}");

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_logger_side_channel_commands() -> Result<()> {
        init_logger();

        let daq = two_device_daq().await;
        let sink = MemSink::default();

        let handle = start(
            daq,
            Box::new(sink),
            LoggerConfig::new(vec!["Mass_Flow".to_string()], 2.0),
        )?;

        let (frames, set_frames) = tokio::task::spawn_blocking(move || {
            let frames = handle
                .get(vec!["Mass_Flow".to_string()], vec!["alpha".to_string()])
                .expect("side-channel read");

            let mut commands = IndexMap::new();
            commands.insert("LOOP".to_string(), vec!["Mass_Flow".to_string()]);
            let set_frames = handle
                .set(commands, vec!["alpha".to_string()])
                .expect("side-channel write");

            handle.stop().expect("worker join");
            (frames, set_frames)
        })
        .await
        .expect("caller join");

        assert!(frames.contains_key("alpha"));
        assert_eq!(frames["alpha"]["Mass_Flow"], Value::Decimal(0.0));

        // The uniform scripted reply is echoed back as the loop variable.
        assert_eq!(set_frames["alpha"]["Loop_Var"], Value::Text("0.0".into()));

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_logger_write_async_flushes_pending() -> Result<()> {
        init_logger();

        let daq = two_device_daq().await;
        let sink = MemSink::default();
        let log = sink.log();

        let mut config = LoggerConfig::new(vec!["Mass_Flow".to_string()], 10.0);
        config.duration = Some(Duration::from_millis(250));
        config.write_async = true;

        let handle = start(daq, Box::new(sink), config)?;
        let written = tokio::task::spawn_blocking(move || handle.wait())
            .await
            .expect("worker join")?;

        let statements = log.lock().expect("statement log");
        let inserts = statements
            .iter()
            .filter(|(sql, _)| sql.starts_with("INSERT INTO alicat"))
            .count();

        // The final pending batch is flushed on the way out.
        assert_eq!(inserts as u64, written);
        assert!(written >= 2, "have: {written}");

        Ok(())
    }
}
