use std::collections::HashSet;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde_json::{json, Value};

use super::{png::encode_png, ImageGrid, SinkError, VisualSink};

/// Pushes scalar plots and image windows to a visdom server over its JSON
/// HTTP API (`/events` creates a window, `/update` appends to one).
pub struct VisdomSink {
    client: reqwest::blocking::Client,
    base_url: String,
    env: String,
    windows: HashSet<String>,
}

impl VisdomSink {
    pub fn new(server: &str, port: u16, env: &str) -> Result<Self, SinkError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("infogan/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .map_err(|err| SinkError::Http {
                message: format!("failed to create HTTP client: {err}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url(server, port),
            env: env.to_string(),
            windows: HashSet::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, endpoint: &str, body: &Value) -> Result<(), SinkError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .map_err(|err| SinkError::Http {
                message: format!("{url}: {err}"),
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(SinkError::Status {
                status: response.status().as_u16(),
            })
        }
    }
}

impl VisualSink for VisdomSink {
    fn name(&self) -> &str {
        "visdom"
    }

    fn scalar(&mut self, series: &str, step: u64, value: f64) -> Result<(), SinkError> {
        let (window, trace) = split_series(series);
        if self.windows.contains(window) {
            self.post("update", &append_body(&self.env, window, trace, step, value))
        } else {
            self.post("events", &line_body(&self.env, window, trace, step, value))?;
            self.windows.insert(window.to_string());
            Ok(())
        }
    }

    fn image(&mut self, name: &str, caption: &str, grid: &ImageGrid) -> Result<(), SinkError> {
        let png = encode_png(grid)?;
        let src = format!("data:image/png;base64,{}", STANDARD.encode(png));
        self.post("events", &image_body(&self.env, name, caption, &src))?;
        self.windows.insert(name.to_string());
        Ok(())
    }
}

fn base_url(server: &str, port: u16) -> String {
    let server = server.trim_end_matches('/');
    let server = if server.contains("://") {
        server.to_string()
    } else {
        format!("http://{}", server)
    };
    format!("{}:{}", server, port)
}

/// `"loss_d/real"` plots trace `real` in window `loss_d`; a bare name is both.
fn split_series(series: &str) -> (&str, &str) {
    series.split_once('/').unwrap_or((series, series))
}

fn line_body(env: &str, window: &str, trace: &str, step: u64, value: f64) -> Value {
    json!({
        "eid": env,
        "win": window,
        "data": [{
            "x": [step],
            "y": [value],
            "name": trace,
            "type": "scatter",
            "mode": "lines",
        }],
        "layout": {
            "title": window,
            "showlegend": true,
            "xaxis": { "title": "step" },
        },
        "opts": { "title": window },
    })
}

fn append_body(env: &str, window: &str, trace: &str, step: u64, value: f64) -> Value {
    json!({
        "eid": env,
        "win": window,
        "name": trace,
        "append": true,
        "data": [{ "x": [step], "y": [value], "name": trace }],
    })
}

fn image_body(env: &str, window: &str, caption: &str, src: &str) -> Value {
    json!({
        "eid": env,
        "win": window,
        "data": [{
            "type": "image",
            "content": { "src": src, "caption": caption },
        }],
        "opts": { "title": window, "caption": caption },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_adds_scheme_and_port() {
        assert_eq!(base_url("http://localhost", 8097), "http://localhost:8097");
        assert_eq!(base_url("localhost/", 8097), "http://localhost:8097");
        assert_eq!(base_url("https://vis.example", 443), "https://vis.example:443");
    }

    #[test]
    fn series_split_into_window_and_trace() {
        assert_eq!(split_series("loss_d/real"), ("loss_d", "real"));
        assert_eq!(split_series("prob_real"), ("prob_real", "prob_real"));
    }

    #[test]
    fn append_body_targets_named_trace() {
        let body = append_body("main", "loss_info", "disc", 3, 0.5);
        assert_eq!(body["win"], "loss_info");
        assert_eq!(body["name"], "disc");
        assert_eq!(body["append"], true);
        assert_eq!(body["data"][0]["x"][0], 3);
    }

    #[test]
    fn image_body_embeds_caption() {
        let body = image_body("main", "fixed", "Epoch 1", "data:image/png;base64,AA==");
        assert_eq!(body["data"][0]["type"], "image");
        assert_eq!(body["data"][0]["content"]["caption"], "Epoch 1");
    }

    #[test]
    fn unreachable_server_is_a_sink_error() -> Result<(), SinkError> {
        let mut sink = VisdomSink::new("http://127.0.0.1", 9, "main")?;
        assert!(sink.scalar("loss_d/real", 1, 0.5).is_err());
        Ok(())
    }
}
