use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::database::{Adapter, AdapterRunState, AdapterState, CleanupCall, DumpEnv};
use crate::error::{Error, Result};
use crate::executor::JobCtx;
use crate::pipeline::{Pipeline, PipelineStage};
use crate::remote::{ControlApi, Method, RemoteControlClient, RemoteEndpoint};

const NAME: &str = "Elasticsearch";
const FLUSH_SETTING: &str = "translog.disable_flush";

fn default_host() -> String {
    "localhost".into()
}

fn default_port() -> u16 {
    9200
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElasticsearchConfig {
    pub id: Option<String>,
    /// Data directory (`path.data` in elasticsearch.yml).
    pub path: String,
    /// Index to back up. `all`, `:all` or no value means every index.
    pub index: Option<String>,
    #[serde(default)]
    pub invoke_flush: bool,
    #[serde(default)]
    pub invoke_close: bool,
    #[serde(default)]
    pub disable_flushing: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ElasticsearchConfig {
    pub fn target(&self) -> IndexTarget {
        IndexTarget::parse(self.index.as_deref())
    }

    /// The configured id with every non-word character replaced by `_`.
    pub fn database_id(&self) -> Option<String> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.chars()
                    .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
                    .collect()
            })
    }

    pub fn dump_filename(&self) -> String {
        match self.database_id() {
            Some(id) => format!("{NAME}-{id}"),
            None => NAME.to_string(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(Error::config(format!(
                "{}: path (the Elasticsearch data directory) is empty",
                self.dump_filename()
            )));
        }
        if self.host.trim().is_empty() {
            return Err(Error::config(format!("{}: host is empty", self.dump_filename())));
        }
        if let IndexTarget::Named(name) = self.target()
            && !valid_index_name(&name)
        {
            return Err(Error::config(format!(
                "{}: invalid index name '{name}'",
                self.dump_filename()
            )));
        }
        Ok(())
    }
}

fn valid_index_name(name: &str) -> bool {
    name != "."
        && name != ".."
        && !name.chars().any(|c| {
            c.is_whitespace()
                || matches!(c, '/' | '\\' | '*' | '?' | '"' | '<' | '>' | '|' | ',' | '#' | ':')
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexTarget {
    /// The whole store. Subset-only calls (close) are never issued for it.
    All,
    Named(String),
}

impl IndexTarget {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") | Some("all") | Some(":all") => IndexTarget::All,
            Some(name) => IndexTarget::Named(name.to_string()),
        }
    }

    fn scoped(&self, action: &str) -> String {
        match self {
            IndexTarget::All => format!("/{action}"),
            IndexTarget::Named(i) => format!("/{i}/{action}"),
        }
    }

    pub fn flush_endpoint(&self) -> String {
        self.scoped("_flush")
    }

    pub fn settings_endpoint(&self) -> String {
        self.scoped("_settings")
    }

    pub fn close_endpoint(&self) -> Option<String> {
        match self {
            IndexTarget::All => None,
            IndexTarget::Named(i) => Some(format!("/{i}/_close")),
        }
    }

    fn label(&self) -> &str {
        match self {
            IndexTarget::All => "all",
            IndexTarget::Named(i) => i,
        }
    }
}

fn flush_settings_body(disable: bool) -> String {
    serde_json::json!({ "index": { FLUSH_SETTING: disable.to_string() } }).to_string()
}

pub struct Elasticsearch {
    cfg: ElasticsearchConfig,
    database_id: Option<String>,
    api: Box<dyn ControlApi>,
}

impl Elasticsearch {
    pub fn new(cfg: ElasticsearchConfig, timeout: Duration) -> Result<Self> {
        let api = RemoteControlClient::new(RemoteEndpoint::new(cfg.host.trim(), cfg.port), timeout)?;
        Self::with_api(cfg, Box::new(api))
    }

    pub fn with_api(cfg: ElasticsearchConfig, api: Box<dyn ControlApi>) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            database_id: cfg.database_id(),
            cfg,
            api,
        })
    }

    pub fn source_path(&self) -> PathBuf {
        let indices = Path::new(self.cfg.path.trim()).join("nodes/0/indices");
        match self.cfg.target() {
            IndexTarget::All => indices,
            IndexTarget::Named(i) => indices.join(i),
        }
    }

    fn pre_copy(&self, ctx: &JobCtx, run: &mut AdapterRunState<'_>) -> Result<()> {
        let target = self.cfg.target();

        if self.cfg.invoke_flush {
            run.control(
                ctx,
                "flush the Elasticsearch index",
                Method::Post,
                &target.flush_endpoint(),
                None,
            )?;
        }

        if self.cfg.disable_flushing {
            let endpoint = target.settings_endpoint();
            run.control(
                ctx,
                "disable flushing of the Elasticsearch index",
                Method::Put,
                &endpoint,
                Some(&flush_settings_body(true)),
            )?;
            run.owe(CleanupCall {
                what: "re-enable flushing of the Elasticsearch index".into(),
                method: Method::Put,
                path: endpoint,
                body: Some(flush_settings_body(false)),
            });
        }

        if self.cfg.invoke_close {
            match target.close_endpoint() {
                Some(endpoint) => run.control(
                    ctx,
                    "close the Elasticsearch index",
                    Method::Post,
                    &endpoint,
                    None,
                )?,
                None => ctx.log("skipping index close: backing up all indices"),
            }
        }
        Ok(())
    }

    fn copy(&self, ctx: &JobCtx, env: &DumpEnv<'_>) -> Result<PathBuf> {
        let src = self.source_path();
        if !src.exists() {
            return Err(Error::NotFound {
                what: "Elasticsearch index directory".into(),
                path: src.display().to_string(),
            });
        }

        let mut pipeline = Pipeline::new();
        pipeline.add(
            PipelineStage::new(env.utilities.resolve("tar")?)
                .args(["-cf", "-"])
                .arg(src.display().to_string()),
        )?;
        let mut ext = String::from(".tar");
        if let Some(c) = env.compressor {
            c.compress_with(&mut pipeline)?;
            ext.push_str(c.extension());
        }
        let dst = env
            .dump_dir
            .join(format!("{}{}", self.dump_filename(), ext));
        pipeline.add(PipelineStage::new(env.utilities.resolve("cat")?).stdout_to(&dst))?;

        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: {pipeline}"));
            return Ok(dst);
        }

        ctx.log(&format!("streaming {} -> {}", src.display(), dst.display()));
        pipeline.run()?;
        if !pipeline.success() {
            if let Err(e) = std::fs::remove_file(&dst)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(artifact = %dst.display(), "failed to remove partial artifact: {e}");
            }
            return Err(Error::Pipeline {
                label: format!("Elasticsearch index '{}' backup", self.cfg.target().label()),
                messages: pipeline.error_messages(),
            });
        }
        info!(attempt = %ctx.attempt_id(), artifact = %dst.display(), "copy finished");
        Ok(dst)
    }
}

impl Adapter for Elasticsearch {
    fn name(&self) -> &'static str {
        NAME
    }

    fn database_id(&self) -> Option<&str> {
        self.database_id.as_deref()
    }

    fn describe(&self) -> Vec<String> {
        let target = self.cfg.target();
        let api = self.api.target();
        let mut out = vec![format!(
            "{} (index: {}, api: {}:{})",
            self.dump_filename(),
            target.label(),
            api.host,
            api.port
        )];
        if self.cfg.invoke_flush {
            out.push(format!("POST {}", target.flush_endpoint()));
        }
        if self.cfg.disable_flushing {
            out.push(format!("PUT {} {}", target.settings_endpoint(), flush_settings_body(true)));
        }
        if self.cfg.invoke_close {
            match target.close_endpoint() {
                Some(ep) => out.push(format!("POST {ep}")),
                None => out.push("(close skipped: all indices)".into()),
            }
        }
        out.push(format!("copy {}", self.source_path().display()));
        if self.cfg.disable_flushing {
            out.push(format!("PUT {} {}", target.settings_endpoint(), flush_settings_body(false)));
        }
        out
    }

    fn perform(&self, ctx: &JobCtx, env: &DumpEnv<'_>) -> Result<PathBuf> {
        let mut run = AdapterRunState::new(self.api.as_ref());
        run.enter(ctx, AdapterState::PreCopy);
        if let Err(e) = self.pre_copy(ctx, &mut run) {
            return run.conclude(ctx, Err(e));
        }
        run.enter(ctx, AdapterState::Copying);
        let copied = self.copy(ctx, env);
        run.conclude(ctx, copied)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::fs;
    use std::rc::Rc;
    use std::sync::mpsc;
    use std::sync::Arc;

    use super::*;
    use crate::executor::{ChannelSink, JobEvent};
    use crate::remote::ControlCallResult;
    use crate::utilities::Utilities;

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Rc<RefCell<Vec<(Method, String, Option<String>)>>>,
        // Status per call, in order; 200 once exhausted.
        script: Rc<RefCell<VecDeque<u16>>>,
    }

    struct FakeApi {
        target: RemoteEndpoint,
        rec: Recorder,
    }

    impl ControlApi for FakeApi {
        fn target(&self) -> &RemoteEndpoint {
            &self.target
        }

        fn call(&self, method: Method, path: &str, body: Option<&str>) -> ControlCallResult {
            self.rec
                .calls
                .borrow_mut()
                .push((method, path.to_string(), body.map(str::to_string)));
            let status = self.rec.script.borrow_mut().pop_front().unwrap_or(200);
            if status == 200 {
                ControlCallResult::Success {
                    status,
                    body: "{}".into(),
                }
            } else {
                ControlCallResult::Rejected {
                    status,
                    body: "{\"error\":\"scripted\"}".into(),
                }
            }
        }
    }

    struct Fixture {
        tmp: tempfile::TempDir,
        dump_dir: PathBuf,
        utilities: Utilities,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let dump_dir = tmp.path().join("dumps");
            fs::create_dir_all(&dump_dir).unwrap();
            Self {
                tmp,
                dump_dir,
                utilities: Utilities::default(),
            }
        }

        fn data_root(&self) -> PathBuf {
            self.tmp.path().join("es-data")
        }

        fn make_index(&self, name: &str) {
            let dir = self.data_root().join("nodes/0/indices").join(name).join("0");
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("segments_1"), b"segment data").unwrap();
        }

        fn env(&self) -> DumpEnv<'_> {
            DumpEnv {
                dump_dir: &self.dump_dir,
                utilities: &self.utilities,
                compressor: None,
            }
        }

        fn config(&self, extra: &str) -> ElasticsearchConfig {
            toml::from_str(&format!("path = \"{}\"\n{extra}", self.data_root().display()))
                .expect("es config")
        }
    }

    fn adapter(cfg: ElasticsearchConfig, script: &[u16]) -> (Elasticsearch, Recorder) {
        let rec = Recorder::default();
        rec.script.borrow_mut().extend(script.iter().copied());
        let api = FakeApi {
            target: RemoteEndpoint::new("localhost", 9200),
            rec: rec.clone(),
        };
        (Elasticsearch::with_api(cfg, Box::new(api)).unwrap(), rec)
    }

    fn ctx() -> (JobCtx, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel();
        (JobCtx::new(false, Arc::new(ChannelSink::new(tx))), rx)
    }

    fn paths(rec: &Recorder) -> Vec<String> {
        rec.calls
            .borrow()
            .iter()
            .map(|(m, p, _)| format!("{m} {p}"))
            .collect()
    }

    fn states(rx: &mpsc::Receiver<JobEvent>) -> Vec<AdapterState> {
        rx.try_iter()
            .filter_map(|ev| match ev {
                JobEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn all_spellings_mean_whole_store() {
        for raw in [None, Some("all"), Some(":all"), Some("  all ")] {
            assert_eq!(IndexTarget::parse(raw), IndexTarget::All, "{raw:?}");
        }
        assert_eq!(
            IndexTarget::parse(Some("widgets")),
            IndexTarget::Named("widgets".into())
        );
    }

    #[test]
    fn endpoints_are_scoped_by_target() {
        let named = IndexTarget::Named("widgets".into());
        assert_eq!(named.flush_endpoint(), "/widgets/_flush");
        assert_eq!(named.settings_endpoint(), "/widgets/_settings");
        assert_eq!(named.close_endpoint().as_deref(), Some("/widgets/_close"));
        assert_eq!(IndexTarget::All.flush_endpoint(), "/_flush");
        assert_eq!(IndexTarget::All.settings_endpoint(), "/_settings");
        assert_eq!(IndexTarget::All.close_endpoint(), None);
    }

    #[test]
    fn settings_body_shape() {
        assert_eq!(
            flush_settings_body(true),
            r#"{"index":{"translog.disable_flush":"true"}}"#
        );
    }

    #[test]
    fn database_id_is_sanitized() {
        let fx = Fixture::new();
        let cfg = fx.config("id = \"prod cluster/1\"");
        assert_eq!(cfg.dump_filename(), "Elasticsearch-prod_cluster_1");
    }

    #[test]
    fn rejects_index_names_with_path_separators() {
        let fx = Fixture::new();
        assert!(fx.config("index = \"../etc\"").validate().is_err());
        assert!(fx.config("index = \"a/b\"").validate().is_err());
    }

    #[test]
    fn named_index_flush_close_copy() {
        let fx = Fixture::new();
        fx.make_index("widgets");
        let (es, rec) = adapter(
            fx.config("index = \"widgets\"\ninvoke_flush = true\ninvoke_close = true"),
            &[],
        );
        let (ctx, rx) = ctx();

        let artifact = es.perform(&ctx, &fx.env()).expect("backup");
        assert_eq!(paths(&rec), vec!["POST /widgets/_flush", "POST /widgets/_close"]);
        assert_eq!(artifact, fx.dump_dir.join("Elasticsearch.tar"));
        assert!(fs::metadata(&artifact).unwrap().len() > 0);
        assert_eq!(
            states(&rx),
            vec![
                AdapterState::PreCopy,
                AdapterState::Copying,
                AdapterState::PostCopy,
                AdapterState::Done
            ]
        );
    }

    #[test]
    fn close_never_issued_for_whole_store() {
        for spelling in ["", "index = \"all\"", "index = \":all\""] {
            let fx = Fixture::new();
            fs::create_dir_all(fx.data_root().join("nodes/0/indices/a")).unwrap();
            let (es, rec) = adapter(
                fx.config(&format!("{spelling}\ninvoke_flush = true\ninvoke_close = true")),
                &[],
            );
            let (ctx, _rx) = ctx();
            es.perform(&ctx, &fx.env()).expect("backup");
            assert_eq!(paths(&rec), vec!["POST /_flush"], "{spelling}");
        }
    }

    #[test]
    fn missing_source_fails_after_calls() {
        let fx = Fixture::new();
        let (es, rec) = adapter(
            fx.config("index = \"widgets\"\ninvoke_flush = true\ninvoke_close = true"),
            &[],
        );
        let (ctx, rx) = ctx();
        let err = es.perform(&ctx, &fx.env()).unwrap_err();
        assert!(err.is_not_found(), "{err}");
        assert_eq!(paths(&rec), vec!["POST /widgets/_flush", "POST /widgets/_close"]);
        assert_eq!(states(&rx).last(), Some(&AdapterState::Failed));
        assert!(fs::read_dir(&fx.dump_dir).unwrap().next().is_none());
    }

    #[test]
    fn failed_disable_skips_copy_and_enable() {
        let fx = Fixture::new();
        fx.make_index("widgets");
        let (es, rec) = adapter(
            fx.config("index = \"widgets\"\ndisable_flushing = true"),
            &[500],
        );
        let (ctx, rx) = ctx();
        let err = es.perform(&ctx, &fx.env()).unwrap_err();
        assert!(err.is_remote_call(), "{err}");
        assert!(err.to_string().contains("500"));
        assert_eq!(paths(&rec), vec!["PUT /widgets/_settings"]);
        assert_eq!(
            states(&rx),
            vec![AdapterState::PreCopy, AdapterState::Failed]
        );
        assert!(fs::read_dir(&fx.dump_dir).unwrap().next().is_none());
    }

    #[test]
    fn disable_is_always_followed_by_one_enable() {
        // Success, missing source, and a failing close all owe the enable call.
        let cases: [(&str, &[u16]); 3] = [
            ("index = \"widgets\"", &[]),
            ("index = \"missing\"", &[]),
            ("index = \"widgets\"\ninvoke_close = true", &[200, 503]),
        ];
        for (extra, script) in cases {
            let fx = Fixture::new();
            fx.make_index("widgets");
            let (es, rec) = adapter(
                fx.config(&format!("{extra}\ndisable_flushing = true")),
                script,
            );
            let (ctx, _rx) = ctx();
            let _ = es.perform(&ctx, &fx.env());

            let calls = rec.calls.borrow();
            let enables: Vec<_> = calls
                .iter()
                .filter(|(_, _, b)| b.as_deref() == Some(flush_settings_body(false).as_str()))
                .collect();
            assert_eq!(enables.len(), 1, "{extra}");
            assert_eq!(
                calls.last().and_then(|(_, _, b)| b.clone()),
                Some(flush_settings_body(false)),
                "{extra}"
            );
        }
    }

    #[test]
    fn enable_failure_after_good_copy_fails_attempt() {
        let fx = Fixture::new();
        fx.make_index("widgets");
        let (es, rec) = adapter(
            fx.config("index = \"widgets\"\ndisable_flushing = true"),
            &[200, 500],
        );
        let (ctx, _rx) = ctx();
        let err = es.perform(&ctx, &fx.env()).unwrap_err();
        assert!(err.is_remote_call(), "{err}");
        assert!(err.to_string().contains("re-enable flushing"), "{err}");
        assert_eq!(rec.calls.borrow().len(), 2);
    }

    #[test]
    fn copy_failure_keeps_pipeline_error_primary() {
        let fx = Fixture::new();
        fx.make_index("widgets");
        let mut overrides = std::collections::BTreeMap::new();
        overrides.insert("cat".to_string(), "/bin/false".to_string());
        let utilities = Utilities::new(&overrides).unwrap();
        let env = DumpEnv {
            dump_dir: &fx.dump_dir,
            utilities: &utilities,
            compressor: None,
        };
        let (es, rec) = adapter(
            fx.config("index = \"widgets\"\ndisable_flushing = true"),
            &[200, 500],
        );
        let (ctx, _rx) = ctx();
        let err = es.perform(&ctx, &env).unwrap_err();
        assert!(err.is_pipeline(), "{err}");
        assert!(matches!(err, Error::Cleanup { .. }));
        assert_eq!(rec.calls.borrow().len(), 2);
        assert!(!fx.dump_dir.join("Elasticsearch.tar").exists());
    }

    #[test]
    fn dry_run_issues_nothing() {
        let fx = Fixture::new();
        fx.make_index("widgets");
        let (es, rec) = adapter(
            fx.config("index = \"widgets\"\ninvoke_flush = true\ndisable_flushing = true"),
            &[],
        );
        let (tx, _rx) = mpsc::channel();
        let ctx = JobCtx::new(true, Arc::new(ChannelSink::new(tx)));
        let artifact = es.perform(&ctx, &fx.env()).expect("dry run");
        assert!(rec.calls.borrow().is_empty());
        assert!(!artifact.exists());
    }

    #[test]
    fn describe_lists_calls_in_order() {
        let fx = Fixture::new();
        let (es, _rec) = adapter(
            fx.config("id = \"main\"\nindex = \"widgets\"\ninvoke_flush = true\ninvoke_close = true\ndisable_flushing = true"),
            &[],
        );
        let lines = es.describe();
        assert!(lines[0].starts_with("Elasticsearch-main"));
        assert_eq!(lines[1], "POST /widgets/_flush");
        assert!(lines[2].starts_with("PUT /widgets/_settings"));
        assert_eq!(lines[3], "POST /widgets/_close");
        assert!(lines.last().unwrap().contains("\"false\""));
    }
}
