// SPDX-License-Identifier: MIT

//! Web dashboard over the detection log
//!
//! A query/view layer plus one ingestion endpoint: detection table with
//! label filtering, gallery, treatment advice for the most frequent species,
//! image serving that probes the three capture directories in fixed order,
//! and an upload route for cameras that push images instead of being polled.

use axum::{
    extract::{Multipart, Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::area::ImageArea;
use crate::classifier::{Classification, Classify, RoboflowClient};
use crate::config::AppConfig;
use crate::db::{Database, Detection, DetectionRecord, EnvironmentReading, NewDetection};

/// Shared application state
pub struct AppState {
    pub db: Database,
    pub area: ImageArea,
    pub config: AppConfig,
    /// None when no API key is configured; uploads are then stored and
    /// logged without classification
    pub classifier: Option<Box<dyn Classify>>,
}

/// Field treatment advice per species
fn advice_for(label: &str) -> &'static str {
    match label {
        "abeja" => "No aplicar insecticidas (polinizador).",
        "algodoncillo" => "Aceite de parafina 1% o jabon potasico.",
        "arana" => "Control biologico. Evitar insecticidas.",
        "barrenillo_de_olivo" => "Clorpirifos 48% o diflubenzuron.",
        "cabezudo_almendro" => "Spinosad o emamectina en brotacion.",
        "cochinilla_negra_del_olivo" => "Aceite mineral + piriproxifen o jabon potasico.",
        "Euzophera" => "Spinosad o B. thuringiensis antes del verano.",
        "Glifodes" => "B. thuringiensis o spinosad.",
        "hormiga" => "Cebo con fipronil o imidacloprid.",
        "mariquita" => "No tratar (beneficioso).",
        "mosca_del_olivo" => "Deltametrina o spinosad en cebo.",
        "polilla_del_olivo" => "B. thuringiensis o lambda-cihalotrina.",
        _ => "Revisar trampas y seguir el protocolo general de campo.",
    }
}

/// Create the web application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Pages
        .route("/", get(index_page))
        .route("/gallery", get(gallery_page))
        .route("/advice", get(advice_page))
        .route("/images/:filename", get(serve_image))
        // API endpoints
        .route("/api/detections", get(api_detections))
        .route("/api/stats", get(api_stats))
        .route("/api/labels", get(api_labels))
        .route("/api/upload", post(api_upload))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// === Page Handlers ===

#[derive(Deserialize)]
struct IndexQuery {
    label: Option<String>,
}

async fn index_page(
    State(state): State<Arc<AppState>>,
    Query(query): Query<IndexQuery>,
) -> Html<String> {
    let records = fetch_filtered(&state.db, query.label.as_deref(), 200);
    let counts = state.db.label_counts().unwrap_or_default();
    let labels = state.db.labels().unwrap_or_default();

    Html(render_index(&records, &counts, &labels, query.label.as_deref()))
}

async fn gallery_page(State(state): State<Arc<AppState>>) -> Html<String> {
    let records = state.db.recent(50).unwrap_or_default();
    Html(render_gallery(&records))
}

async fn advice_page(State(state): State<Arc<AppState>>) -> Html<String> {
    let counts = state.db.label_counts().unwrap_or_default();
    Html(render_advice(counts.first()))
}

/// Serve an archived image by bare filename, probing detected, undetected,
/// inbox in that order
async fn serve_image(
    State(state): State<Arc<AppState>>,
    AxumPath(filename): AxumPath<String>,
) -> impl IntoResponse {
    let Some(path) = state.area.resolve(&filename) else {
        warn!("Image not found in any directory: {}", filename);
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response(),
        Err(e) => {
            warn!("Failed to read {:?}: {}", path, e);
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

// === API Handlers ===

#[derive(Deserialize)]
struct DetectionsQuery {
    limit: Option<usize>,
    label: Option<String>,
}

async fn api_detections(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DetectionsQuery>,
) -> Json<Vec<DetectionRecord>> {
    let limit = query.limit.unwrap_or(50);
    Json(fetch_filtered(&state.db, query.label.as_deref(), limit))
}

#[derive(Serialize)]
struct StatsResponse {
    total: i64,
    detected: i64,
    notified: i64,
    labels: Vec<(String, i64)>,
}

async fn api_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let stats = state.db.stats().unwrap_or(crate::db::DbStats {
        total: 0,
        detected: 0,
        notified: 0,
    });
    let labels = state.db.label_counts().unwrap_or_default();
    Json(StatsResponse {
        total: stats.total,
        detected: stats.detected,
        notified: stats.notified,
        labels,
    })
}

async fn api_labels(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.db.labels().unwrap_or_default())
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    status: &'static str,
    insect: Option<String>,
    confidence: Option<f64>,
    stored_in: String,
    filename: String,
}

/// Accept an image pushed by a remote camera: multipart `file` plus
/// optional `camera_name`, `temperature` and `humidity` form fields
async fn api_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut camera_name: Option<String> = None;
    let mut environment = EnvironmentReading::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": format!("Invalid multipart body: {}", e)})),
                )
                    .into_response()
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let original = field.file_name().unwrap_or("upload.jpg").to_string();
                match field.bytes().await {
                    Ok(bytes) => file = Some((original, bytes.to_vec())),
                    Err(e) => {
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(serde_json::json!({"error": format!("Failed to read file: {}", e)})),
                        )
                            .into_response()
                    }
                }
            }
            "camera_name" => camera_name = field.text().await.ok().filter(|s| !s.is_empty()),
            "temperature" => {
                environment.temperature = field.text().await.ok().as_deref().and_then(parse_reading)
            }
            "humidity" => {
                environment.humidity = field.text().await.ok().as_deref().and_then(parse_reading)
            }
            _ => {}
        }
    }

    let Some((original, bytes)) = file else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "No file provided"})),
        )
            .into_response();
    };

    match ingest_upload(&state, &original, &bytes, camera_name, environment).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            warn!("Upload ingestion failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response()
        }
    }
}

/// Sensor form fields arrive as text; empty and "None" mean absent
fn parse_reading(raw: &str) -> Option<f64> {
    match raw.trim() {
        "" | "None" => None,
        value => value.parse().ok(),
    }
}

/// Basename with anything outside `[A-Za-z0-9._-]` replaced, so an uploaded
/// filename cannot escape the inbox
fn sanitize_upload_name(original: &str) -> String {
    let name = Path::new(original)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.jpg");
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Store, classify, archive and log one pushed image. Mirrors a loop cycle
/// without the notification stage; classification failure degrades to no
/// detection, and the record is written with `notified = false`.
async fn ingest_upload(
    state: &AppState,
    original_name: &str,
    bytes: &[u8],
    camera_name: Option<String>,
    environment: EnvironmentReading,
) -> crate::Result<UploadResponse> {
    state.area.ensure_dirs()?;

    let filename = format!(
        "{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        sanitize_upload_name(original_name)
    );
    let inbox_path = state.area.inbox.join(&filename);
    tokio::fs::write(&inbox_path, bytes).await?;
    info!("Received upload {} ({} bytes)", filename, bytes.len());

    let classification = match &state.classifier {
        Some(classifier) => match classifier.classify(&inbox_path).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Upload classification failed, treating as no detection: {}", e);
                Classification::default()
            }
        },
        None => Classification::default(),
    };
    let detection = match classification.best() {
        Some(p) => Detection::Insect {
            label: p.class.clone(),
            confidence: p.confidence,
        },
        None => Detection::None,
    };

    let archived = state.area.archive(&inbox_path, &detection);
    let stored_in = if archived.path().starts_with(&state.area.detected) {
        "detected"
    } else if archived.path().starts_with(&state.area.undetected) {
        "undetected"
    } else {
        "inbox"
    };

    state.db.insert_detection(&NewDetection {
        camera_name: camera_name.unwrap_or_else(|| state.config.camera.name.clone()),
        filename: filename.clone(),
        processed_filename: None,
        detection: detection.clone(),
        environment,
        captured_at: Utc::now(),
        notified: false,
    })?;

    Ok(UploadResponse {
        status: "ok",
        insect: detection.label().map(str::to_string),
        confidence: detection.confidence(),
        stored_in: stored_in.to_string(),
        filename,
    })
}

/// Shared filter logic: no filter, `none` for undetected cycles, or a label
fn fetch_filtered(db: &Database, label: Option<&str>, limit: usize) -> Vec<DetectionRecord> {
    match label {
        None | Some("") => db.recent(limit),
        Some("none") => db.without_label(limit),
        Some(l) => db.by_label(l, limit),
    }
    .unwrap_or_default()
}

// === Template Rendering ===

fn base_template(title: &str, content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="es">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>{} - Bugwatch</title>
    <style>
        :root {{
            --bg-primary: #13240f;
            --bg-card: #1e3a18;
            --text-primary: #eef3ea;
            --text-secondary: #9fb497;
            --accent: #8bc34a;
            --border: #2e4f26;
        }}
        * {{ box-sizing: border-box; margin: 0; padding: 0; }}
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: var(--bg-primary);
            color: var(--text-primary);
            line-height: 1.6;
        }}
        .container {{ max-width: 1200px; margin: 0 auto; padding: 20px; }}
        nav {{
            background: var(--bg-card);
            padding: 15px 20px;
            display: flex;
            align-items: center;
            gap: 30px;
            border-bottom: 1px solid var(--border);
        }}
        nav .logo {{
            font-size: 1.5em;
            font-weight: bold;
            color: var(--accent);
            text-decoration: none;
        }}
        nav a {{
            color: var(--text-secondary);
            text-decoration: none;
        }}
        nav a:hover {{ color: var(--text-primary); }}
        .card {{
            background: var(--bg-card);
            border-radius: 12px;
            padding: 20px;
            margin-bottom: 20px;
        }}
        .card h2 {{ margin-bottom: 15px; color: var(--accent); }}
        table {{ width: 100%; border-collapse: collapse; }}
        th, td {{
            padding: 10px;
            text-align: left;
            border-bottom: 1px solid var(--border);
        }}
        th {{ color: var(--text-secondary); font-weight: 500; }}
        .badge {{
            display: inline-block;
            background: var(--accent);
            color: #13240f;
            padding: 2px 10px;
            border-radius: 12px;
            font-size: 0.85em;
        }}
        .badge.none {{ background: var(--border); color: var(--text-secondary); }}
        .filters a {{
            color: var(--text-secondary);
            text-decoration: none;
            margin-right: 12px;
        }}
        .filters a.active {{ color: var(--accent); font-weight: bold; }}
        .grid {{
            display: grid;
            grid-template-columns: repeat(auto-fill, minmax(220px, 1fr));
            gap: 16px;
        }}
        .grid img {{ width: 100%; border-radius: 8px; display: block; }}
        .grid .caption {{ font-size: 0.85em; color: var(--text-secondary); }}
    </style>
</head>
<body>
    <nav>
        <a href="/" class="logo">Bugwatch</a>
        <a href="/">Detecciones</a>
        <a href="/gallery">Galeria</a>
        <a href="/advice">Recomendacion</a>
    </nav>
    <main class="container">
        {}
    </main>
</body>
</html>"#,
        title, content
    )
}

fn render_index(
    records: &[DetectionRecord],
    counts: &[(String, i64)],
    labels: &[String],
    active: Option<&str>,
) -> String {
    let filters: String = std::iter::once(("".to_string(), "Todas".to_string()))
        .chain(std::iter::once(("none".to_string(), "Sin deteccion".to_string())))
        .chain(labels.iter().map(|l| (l.clone(), l.clone())))
        .map(|(value, text)| {
            let class = if active.unwrap_or("") == value { "active" } else { "" };
            let href = if value.is_empty() {
                "/".to_string()
            } else {
                format!("/?label={}", value)
            };
            format!(r#"<a class="{}" href="{}">{}</a>"#, class, href, text)
        })
        .collect();

    let rows: String = records
        .iter()
        .map(|r| {
            let badge = match &r.insect {
                Some(label) => format!(
                    r#"<span class="badge">{}</span>"#,
                    label
                ),
                None => r#"<span class="badge none">sin deteccion</span>"#.to_string(),
            };
            let confidence = r
                .confidence
                .map(|c| format!("{:.0}%", c * 100.0))
                .unwrap_or_else(|| "-".to_string());
            format!(
                r#"<tr>
                    <td>{}</td>
                    <td>{}</td>
                    <td>{}</td>
                    <td><a href="/images/{}">{}</a></td>
                    <td>{}</td>
                </tr>"#,
                r.created_at.format("%Y-%m-%d %H:%M"),
                badge,
                confidence,
                r.filename,
                r.filename,
                if r.notified { "si" } else { "no" },
            )
        })
        .collect();

    let counts_rows: String = counts
        .iter()
        .map(|(label, n)| format!("<tr><td>{}</td><td>{}</td></tr>", label, n))
        .collect();

    let content = format!(
        r#"
        <h1>Detecciones</h1>
        <div class="card filters">{}</div>
        <div style="display: grid; grid-template-columns: 2fr 1fr; gap: 20px;">
            <div class="card">
                <table>
                    <tr><th>Fecha</th><th>Insecto</th><th>Confianza</th><th>Imagen</th><th>Avisado</th></tr>
                    {}
                </table>
            </div>
            <div class="card">
                <h2>Conteo</h2>
                <table>
                    <tr><th>Insecto</th><th>Total</th></tr>
                    {}
                </table>
            </div>
        </div>
    "#,
        filters, rows, counts_rows
    );

    base_template("Detecciones", &content)
}

fn render_gallery(records: &[DetectionRecord]) -> String {
    let cells: String = records
        .iter()
        .map(|r| {
            // Show the annotated variant when one exists
            let image = r.processed_filename.as_deref().unwrap_or(&r.filename);
            format!(
                r#"<div>
                    <img src="/images/{}" alt="{}" loading="lazy">
                    <div class="caption">{} - {}</div>
                </div>"#,
                image,
                r.filename,
                r.insect.as_deref().unwrap_or("sin deteccion"),
                r.created_at.format("%Y-%m-%d %H:%M"),
            )
        })
        .collect();

    let content = format!(
        r#"
        <h1>Galeria</h1>
        <div class="card">
            <div class="grid">{}</div>
        </div>
    "#,
        cells
    );

    base_template("Galeria", &content)
}

fn render_advice(top: Option<&(String, i64)>) -> String {
    let content = match top {
        Some((label, total)) => format!(
            r#"
            <h1>Recomendacion</h1>
            <div class="card">
                <h2>{}</h2>
                <p>Detectado {} veces.</p>
                <p>{}</p>
            </div>
        "#,
            label,
            total,
            advice_for(label)
        ),
        None => r#"
            <h1>Recomendacion</h1>
            <div class="card"><p>No existen detecciones registradas.</p></div>
        "#
        .to_string(),
    };

    base_template("Recomendacion", &content)
}

/// Start the dashboard server
pub async fn start_server(config: AppConfig, db: Database, area: ImageArea) -> crate::Result<()> {
    let addr = format!("{}:{}", config.web.host, config.web.port);
    let classifier = RoboflowClient::new(&config.classifier)
        .ok()
        .map(|c| Box::new(c) as Box<dyn Classify>);
    if classifier.is_none() {
        warn!("Classifier not configured, uploads will be logged without classification");
    }
    let state = Arc::new(AppState {
        db,
        area,
        config,
        classifier,
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Dashboard available at http://{}", addr);

    let router = create_router(state);
    axum::serve(listener, router)
        .await
        .map_err(|e| crate::BugwatchError::Config(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Prediction;
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn seeded_db() -> Database {
        let db = Database::in_memory().unwrap();
        for (label, notified) in [
            (Some(("mosca_del_olivo", 0.91)), true),
            (Some(("mosca_del_olivo", 0.55)), false),
            (None, false),
        ] {
            db.insert_detection(&NewDetection {
                camera_name: "cam".to_string(),
                filename: "cam_x_20250801-120000.jpg".to_string(),
                processed_filename: None,
                detection: match label {
                    Some((l, c)) => Detection::Insect {
                        label: l.to_string(),
                        confidence: c,
                    },
                    None => Detection::None,
                },
                environment: EnvironmentReading::default(),
                captured_at: Utc::now(),
                notified,
            })
            .unwrap();
        }
        db
    }

    #[test]
    fn filter_logic_covers_all_three_modes() {
        let db = seeded_db();
        assert_eq!(fetch_filtered(&db, None, 10).len(), 3);
        assert_eq!(fetch_filtered(&db, Some("none"), 10).len(), 1);
        assert_eq!(fetch_filtered(&db, Some("mosca_del_olivo"), 10).len(), 2);
        assert_eq!(fetch_filtered(&db, Some("abeja"), 10).len(), 0);
    }

    #[test]
    fn advice_known_and_fallback() {
        assert!(advice_for("mariquita").contains("beneficioso"));
        assert!(advice_for("desconocido").contains("protocolo general"));
    }

    struct FixedClassifier(Vec<Prediction>);

    #[async_trait]
    impl Classify for FixedClassifier {
        async fn classify(&self, _image: &Path) -> crate::Result<Classification> {
            Ok(Classification {
                predictions: self.0.clone(),
                annotated_image: None,
            })
        }
    }

    fn upload_state(tmp: &TempDir, classifier: Option<Box<dyn Classify>>) -> AppState {
        let area = ImageArea::new(
            tmp.path().join("inbox"),
            tmp.path().join("detected"),
            tmp.path().join("undetected"),
        );
        area.ensure_dirs().unwrap();
        AppState {
            db: Database::in_memory().unwrap(),
            area,
            config: AppConfig::default(),
            classifier,
        }
    }

    #[tokio::test]
    async fn upload_is_classified_archived_and_recorded() {
        let tmp = TempDir::new().unwrap();
        let state = upload_state(
            &tmp,
            Some(Box::new(FixedClassifier(vec![Prediction {
                class: "abeja".to_string(),
                confidence: 0.84,
            }]))),
        );

        let environment = EnvironmentReading {
            temperature: Some(28.0),
            humidity: Some(55.0),
        };
        let response = ingest_upload(
            &state,
            "../trampa norte.jpg",
            b"jpeg-bytes",
            Some("remote-cam".to_string()),
            environment,
        )
        .await
        .unwrap();

        assert_eq!(response.status, "ok");
        assert_eq!(response.insect.as_deref(), Some("abeja"));
        assert_eq!(response.confidence, Some(0.84));
        assert_eq!(response.stored_in, "detected");
        // Path components stripped, space replaced
        assert!(response.filename.ends_with("_trampa_norte.jpg"));
        assert!(state.area.detected.join(&response.filename).is_file());
        assert!(!state.area.inbox.join(&response.filename).exists());

        let record = &state.db.recent(1).unwrap()[0];
        assert_eq!(record.camera_name, "remote-cam");
        assert_eq!(record.insect.as_deref(), Some("abeja"));
        assert_eq!(record.temperature, Some(28.0));
        assert_eq!(record.humidity, Some(55.0));
        assert!(!record.notified);
    }

    #[tokio::test]
    async fn upload_without_classifier_lands_in_undetected() {
        let tmp = TempDir::new().unwrap();
        let state = upload_state(&tmp, None);

        let response = ingest_upload(
            &state,
            "foto.jpg",
            b"jpeg-bytes",
            None,
            EnvironmentReading::default(),
        )
        .await
        .unwrap();

        assert!(response.insect.is_none());
        assert!(response.confidence.is_none());
        assert_eq!(response.stored_in, "undetected");
        assert!(state.area.undetected.join(&response.filename).is_file());

        let record = &state.db.recent(1).unwrap()[0];
        // Falls back to the configured camera name
        assert_eq!(record.camera_name, state.config.camera.name);
        assert!(record.insect.is_none());
    }

    #[test]
    fn sensor_readings_parse_leniently() {
        assert_eq!(parse_reading("27.5"), Some(27.5));
        assert_eq!(parse_reading(" 27.5 "), Some(27.5));
        assert_eq!(parse_reading(""), None);
        assert_eq!(parse_reading("None"), None);
        assert_eq!(parse_reading("abc"), None);
    }

    #[test]
    fn index_renders_records_and_filters() {
        let db = seeded_db();
        let records = db.recent(10).unwrap();
        let counts = db.label_counts().unwrap();
        let labels = db.labels().unwrap();

        let html = render_index(&records, &counts, &labels, Some("mosca_del_olivo"));
        assert!(html.contains("mosca_del_olivo"));
        assert!(html.contains("sin deteccion"));
        assert!(html.contains("91%"));
    }
}
