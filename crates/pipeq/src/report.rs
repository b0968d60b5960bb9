//! Static HTML and JSON views of an experiment snapshot.
use std::fmt::Write;
use std::path::PathBuf;

use serde_json::Value;

use crate::TOOL_NAME;
use crate::common::config::Config;
use crate::common::utils::time::format_local_now;
use crate::marker::JsonMap;
use crate::model::{ExecutionStatus, Experiment};
use crate::projector::{ExperimentSnapshot, JobSnapshot, Projector, StageSnapshot};
use crate::rundir::RunDir;

const EXPERIMENT_SUMMARY_STATS: &[&str] = &["name_code", "time_started", "time_finished"];
const STAGE_SUMMARY_STATS: &[&str] = &["time_wall_clock_avg_seconds"];
const JOB_SUMMARY_STATS: &[&str] = &["exit_code", "time_wall_clock_seconds"];
const SUMMARY_ENVIRON: &[&str] = &[
    "USER",
    "PWD",
    "HOME",
    "HOSTNAME",
    "CUDA_VISIBLE_DEVICES",
    "JOB_ID",
    "PATH",
    "LD_LIBRARY_PATH",
];

const STYLE: &str = r#"
body {font-family: sans-serif; margin: 1em 2em}
table {border-collapse: collapse; margin-bottom: 1em}
td, th {border: 1px solid #ccc; padding: 2px 8px; text-align: left; vertical-align: top}
pre {background: #f6f6f6; padding: 4px; max-height: 30em; overflow: auto}
details {margin-left: 1em}
.status-waiting {background-color: white}
.status-submitted {background-color: gray}
.status-running {background-color: lightgreen}
.status-success {background-color: green}
.status-error {background-color: red}
.status-killed {background-color: orange}
.status-canceled {background-color: salmon}
"#;

pub fn report_file_name(name_code: &str) -> String {
    format!("{name_code}.html")
}

pub fn render_json(snapshot: &ExperimentSnapshot) -> crate::Result<String> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

/// Renders a self-contained page. The snapshot is also embedded as JSON so that the page can
/// be processed by other tools.
pub fn render_html(snapshot: &ExperimentSnapshot, generated_at: &str) -> crate::Result<String> {
    let json = serde_json::to_string(snapshot)?.replace("</", "<\\/");

    let mut page = String::new();
    writeln!(page, "<!DOCTYPE html>")?;
    writeln!(page, "<html lang=\"en\">")?;
    writeln!(page, "<head>")?;
    writeln!(page, "<title>{}</title>", escape(&snapshot.name_code))?;
    writeln!(page, "<meta charset=\"utf-8\" />")?;
    writeln!(page, "<meta http-equiv=\"cache-control\" content=\"no-cache\" />")?;
    writeln!(page, "<style>{STYLE}</style>")?;
    writeln!(page, "</head>")?;
    writeln!(page, "<body>")?;
    writeln!(
        page,
        "<h1>{} {}</h1>",
        escape(&snapshot.name),
        status_badge(snapshot.status)
    )?;
    write_experiment(&mut page, snapshot)?;
    for stage in &snapshot.stages {
        write_stage(&mut page, stage)?;
    }
    writeln!(
        page,
        "<p><small>Generated by {TOOL_NAME} at {}</small></p>",
        escape(generated_at)
    )?;
    writeln!(
        page,
        "<script type=\"application/json\" id=\"{TOOL_NAME}-report\">{json}</script>"
    )?;
    writeln!(page, "</body>")?;
    writeln!(page, "</html>")?;
    Ok(page)
}

/// Writes the HTML report into every configured HTML root.
pub fn write_reports(
    config: &Config,
    snapshot: &ExperimentSnapshot,
) -> crate::Result<Vec<PathBuf>> {
    let page = render_html(snapshot, &format_local_now(&config.strftime))?;
    let mut written = vec![];
    for root in config.html_roots() {
        std::fs::create_dir_all(&root)?;
        let path = root.join(report_file_name(&snapshot.name_code));
        std::fs::write(&path, &page)?;
        log::debug!("Report written to {}", path.display());
        written.push(path);
    }
    Ok(written)
}

/// Projects `experiment` and writes its HTML report.
pub fn write_experiment_report(
    config: &Config,
    run_dir: &RunDir,
    experiment: &Experiment,
) -> crate::Result<Vec<PathBuf>> {
    let snapshot = Projector::new(run_dir, config).snapshot(experiment)?;
    write_reports(config, &snapshot)
}

fn write_experiment(page: &mut String, snapshot: &ExperimentSnapshot) -> std::fmt::Result {
    writeln!(page, "<table>")?;
    for key in EXPERIMENT_SUMMARY_STATS {
        if let Some(value) = snapshot.stats.get(*key) {
            write_row(page, key, &format_stat(key, value))?;
        }
    }
    writeln!(page, "</table>")?;

    writeln!(page, "<table>")?;
    writeln!(page, "<tr><th>stage</th><th>status</th><th>jobs</th></tr>")?;
    for stage in &snapshot.stages {
        writeln!(
            page,
            "<tr><td><a href=\"#{name}\">{name}</a></td><td>{}</td><td>{}</td></tr>",
            status_badge(stage.status),
            stage.jobs.len(),
            name = escape(&stage.name),
        )?;
    }
    writeln!(page, "</table>")?;

    writeln!(page, "<details><summary>experiment details</summary>")?;
    write_map(page, "stats", &snapshot.stats)?;
    write_environ(page, &snapshot.environ)?;
    write_pre(page, "env", &format_env(&snapshot.env))?;
    write_pre(page, &snapshot.stdout_path.display().to_string(), &snapshot.stdout)?;
    write_pre(page, &snapshot.stderr_path.display().to_string(), &snapshot.stderr)?;
    writeln!(page, "</details>")
}

fn write_stage(page: &mut String, stage: &StageSnapshot) -> std::fmt::Result {
    writeln!(
        page,
        "<h2 id=\"{}\">{} {}</h2>",
        escape(&stage.name),
        escape(&stage.name),
        status_badge(stage.status)
    )?;

    writeln!(page, "<table>")?;
    for key in STAGE_SUMMARY_STATS {
        if let Some(value) = stage.stats.get(*key) {
            write_row(page, &format_stat_name(key), &format_stat(key, value))?;
        }
    }
    writeln!(page, "</table>")?;

    writeln!(page, "<table>")?;
    write!(page, "<tr><th>job</th><th>status</th>")?;
    for key in JOB_SUMMARY_STATS {
        write!(page, "<th>{}</th>", escape(&format_stat_name(key)))?;
    }
    writeln!(page, "</tr>")?;
    for job in &stage.jobs {
        write!(
            page,
            "<tr><td>{}</td><td>{}</td>",
            escape(&job.name),
            status_badge(job.status)
        )?;
        for key in JOB_SUMMARY_STATS {
            let value = job
                .stats
                .get(*key)
                .map(|value| format_stat(key, value))
                .unwrap_or_default();
            write!(page, "<td>{}</td>", escape(&value))?;
        }
        writeln!(page, "</tr>")?;
    }
    writeln!(page, "</table>")?;

    writeln!(page, "<details><summary>stage details</summary>")?;
    write_map(page, "stats", &stage.stats)?;
    write_pre(page, "env", &format_env(&stage.env))?;
    write_pre(page, "script", &stage.script)?;
    write_pre(page, "stdout", &stage.stdout)?;
    write_pre(page, "stderr", &stage.stderr)?;
    writeln!(page, "</details>")?;

    for job in &stage.jobs {
        write_job(page, job)?;
    }
    Ok(())
}

fn write_job(page: &mut String, job: &JobSnapshot) -> std::fmt::Result {
    writeln!(
        page,
        "<details><summary>{} {}</summary>",
        escape(&job.name),
        status_badge(job.status)
    )?;
    for result in &job.results {
        let name = result.get("name").and_then(Value::as_str).unwrap_or_default();
        match result.get("value") {
            Some(Value::String(value)) => write_pre(page, &format!("result {name}"), value)?,
            Some(value) => write_pre(page, &format!("result {name}"), &value.to_string())?,
            None => write_map(page, &format!("result {name}"), result)?,
        }
    }
    write_map(page, "stats", &job.stats)?;
    write_environ(page, &job.environ)?;
    write_pre(page, "env", &format_env(&job.env))?;
    write_pre(page, &job.script_path.display().to_string(), &job.script)?;
    write_pre(page, &job.stdout_path.display().to_string(), &job.stdout)?;
    write_pre(page, &job.stderr_path.display().to_string(), &job.stderr)?;
    writeln!(page, "</details>")
}

fn write_environ(page: &mut String, environ: &JsonMap) -> std::fmt::Result {
    let summary: JsonMap = SUMMARY_ENVIRON
        .iter()
        .filter_map(|key| environ.get(*key).map(|value| (key.to_string(), value.clone())))
        .collect();
    write_map(page, "environ", &summary)
}

fn write_map(page: &mut String, title: &str, map: &JsonMap) -> std::fmt::Result {
    if map.is_empty() {
        return Ok(());
    }
    writeln!(page, "<table><tr><th colspan=\"2\">{}</th></tr>", escape(title))?;
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for key in keys {
        write_row(page, &format_stat_name(key), &format_stat(key, &map[key]))?;
    }
    writeln!(page, "</table>")
}

fn write_row(page: &mut String, key: &str, value: &str) -> std::fmt::Result {
    writeln!(page, "<tr><td>{}</td><td>{}</td></tr>", escape(key), escape(value))
}

fn write_pre(page: &mut String, title: &str, content: &str) -> std::fmt::Result {
    writeln!(
        page,
        "<details><summary>{}</summary><pre>{}</pre></details>",
        escape(title),
        escape(content)
    )
}

fn status_badge(status: ExecutionStatus) -> String {
    format!("<span class=\"status-{status}\">{status}</span>")
}

fn format_env(env: &crate::Map<String, String>) -> String {
    env.iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_stat_name(name: &str) -> String {
    if name.contains("seconds") {
        format!("{name} (h:m:s)")
    } else if name.contains("kbytes") {
        format!("{name} (GB)")
    } else {
        name.to_string()
    }
}

/// Durations are shown as `h:m:s`, memory in gigabytes.
fn format_stat(name: &str, value: &Value) -> String {
    match value {
        Value::Number(number) => {
            let Some(number) = number.as_f64() else {
                return number.to_string();
            };
            if name.contains("seconds") {
                let seconds = number.round() as u64;
                format!("{}:{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
            } else if name.contains("kbytes") {
                format!("{:.1}", number / 1024.0 / 1024.0)
            } else {
                value.to_string()
            }
        }
        Value::String(value) => value.clone(),
        Value::Null => String::new(),
        value => value.to_string(),
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::common::config::Config;
    use crate::projector::Projector;
    use crate::report::{escape, format_stat, render_html, render_json, write_reports};
    use crate::rundir::RunDir;
    use crate::tests::utils::{StageBuilder, experiment};

    #[test]
    fn test_format_stat() {
        assert_eq!(format_stat("time_wall_clock_seconds", &json!(3725.4)), "1:02:05");
        assert_eq!(format_stat("max_rss_kbytes", &json!(2097152)), "2.0");
        assert_eq!(format_stat("exit_code", &json!(1)), "1");
        assert_eq!(format_stat("hostname", &json!("node1")), "node1");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("<a href=\"x\">&</a>"), "&lt;a href=&quot;x&quot;&gt;&amp;&lt;/a&gt;");
    }

    #[test]
    fn test_write_reports() {
        let tmp = tempfile::TempDir::with_prefix("pipeq").unwrap();
        let experiment = experiment(vec![
            StageBuilder::default().name("prep").jobs(2),
            StageBuilder::default().name("train"),
        ]);
        let config = Config {
            root: tmp.path().to_path_buf(),
            html_root: vec![tmp.path().join("a"), tmp.path().join("b")],
            ..Default::default()
        };
        let run_dir = RunDir::new(&config.root, &experiment.name_code);
        let snapshot = Projector::new(&run_dir, &config)
            .snapshot(&experiment)
            .unwrap();

        let written = write_reports(&config, &snapshot).unwrap();
        assert_eq!(
            written,
            vec![
                tmp.path().join("a").join("exp_ABC.html"),
                tmp.path().join("b").join("exp_ABC.html")
            ]
        );
        let page = std::fs::read_to_string(&written[0]).unwrap();
        assert!(page.contains("<title>exp_ABC</title>"));
        assert!(page.contains("<h2 id=\"train\">"));
        assert!(page.contains("<span class=\"status-waiting\">waiting</span>"));

        let html = render_html(&snapshot, "now").unwrap();
        assert!(html.contains("Generated by pipeq at now"));
        let json: serde_json::Value = serde_json::from_str(&render_json(&snapshot).unwrap()).unwrap();
        assert_eq!(json["name_code"], json!("exp_ABC"));
        assert_eq!(json["stages"][0]["jobs"][1]["name"], json!("1"));
        assert_eq!(json["stages"][1]["status"], json!("waiting"));
    }
}
