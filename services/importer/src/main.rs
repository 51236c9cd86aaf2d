//! Importer Service - Loads activity extracts into the portal database
//!
//! Responsibilities:
//! - Read the tabular extract (xlsx/xls/ods via calamine, CSV fallback)
//! - Remap messy human-authored headers to canonical field names
//! - Normalize dates (day-first), completion percentages and status text
//! - Get-or-create dimension rows (empresa, area, usuario) without duplicates
//! - Insert actividad facts in a single batch transaction
//! - Record the run summary in job_runs
//!
//! CRITICAL: the draft-building stage must be DETERMINISTIC
//! Same extract + same configuration = same drafts, same synthesized emails

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use chrono::{Datelike, NaiveDate};
use clap::Parser;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "importer", about = "Imports activity extracts into the portal database")]
struct Args {
    /// Source file (xlsx/xls/ods or CSV); overrides SOURCE_FILE
    #[arg(long)]
    file: Option<PathBuf>,

    /// Empresa the imported activities belong to; overrides DEFAULT_EMPRESA
    #[arg(long)]
    empresa: Option<String>,

    /// Dry run - parse and report, don't touch the database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

#[derive(Debug, Clone)]
struct Config {
    db_url: String,
    source_file: PathBuf,
    default_empresa: String,
    default_ruc: String,
    email_domain: String,
    placeholder_password: String,
    skip_rows: usize,
}

impl Config {
    fn from_env() -> Result<Self> {
        Ok(Self {
            db_url: std::env::var("DB_URL").context("DB_URL env var missing")?,
            source_file: PathBuf::from(
                std::env::var("SOURCE_FILE").unwrap_or_else(|_| "datos_scp.csv.xlsx".to_string()),
            ),
            default_empresa: std::env::var("DEFAULT_EMPRESA")
                .unwrap_or_else(|_| "Cliente Principal".to_string()),
            default_ruc: std::env::var("DEFAULT_RUC")
                .unwrap_or_else(|_| "20600000001".to_string()),
            email_domain: std::env::var("EMAIL_DOMAIN")
                .unwrap_or_else(|_| "consultora.local".to_string()),
            // Synthesized usuarios receive this credential; it must be reset
            // before the account can be used to log in.
            placeholder_password: std::env::var("PLACEHOLDER_PASSWORD")
                .unwrap_or_else(|_| "123456".to_string()),
            skip_rows: std::env::var("HEADER_SKIP_ROWS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()
                .unwrap_or(7),
        })
    }
}

/// Per-run summary emitted to job_runs and printed at the end
#[derive(Debug, Serialize)]
struct ImportSummary {
    rows_read: usize,
    rows_imported: usize,
    rows_skipped: usize,
}

// =============================================================================
// VALUE NORMALIZERS - pure, fail closed, never raise
// =============================================================================

/// Activity lifecycle states as stored in the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Estado {
    Abierta,
    Cerrada,
    Atrasada,
    Bloqueado,
}

/// Ordered substring rules; first match wins, so specific tokens must come
/// before the generic fallback. Extracts mix Spanish and English status text.
const ESTADO_RULES: &[(&[&str], Estado)] = &[
    (&["cerrada", "closed"], Estado::Cerrada),
    (&["atrasada", "late"], Estado::Atrasada),
    (&["bloq", "block"], Estado::Bloqueado),
];

impl Estado {
    fn from_raw(raw: &str) -> Estado {
        let needle = raw.trim().to_lowercase();
        for (tokens, estado) in ESTADO_RULES {
            if tokens.iter().any(|t| needle.contains(t)) {
                return *estado;
            }
        }
        Estado::Abierta
    }

    fn as_str(self) -> &'static str {
        match self {
            Estado::Abierta => "Abierta",
            Estado::Cerrada => "Cerrada",
            Estado::Atrasada => "Atrasada",
            Estado::Bloqueado => "Bloqueado",
        }
    }
}

/// Text date formats, day-first. The extract comes from a dd/mm/yyyy locale,
/// so ambiguous two-digit-leading values always resolve day-first.
const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%d/%m/%y", "%Y-%m-%d"];

fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    // Some text cells carry a time suffix; the date is the first token.
    let token = raw.split_whitespace().next()?;
    DATE_FORMATS.iter().find_map(|fmt| {
        // %Y accepts two digits as a literal year 24, which would shadow
        // the %y fallback; activity dates are always modern.
        NaiveDate::parse_from_str(token, fmt)
            .ok()
            .filter(|d| d.year() >= 1900)
    })
}

/// Convert a raw cell to a date, or None if empty/unparsable
fn normalize_date(cell: &Data) -> Option<NaiveDate> {
    match cell {
        Data::DateTime(dt) => dt.as_datetime().map(|dt| dt.date()),
        Data::DateTimeIso(s) => s
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
        Data::String(s) => parse_date_text(s),
        _ => None,
    }
}

// Extracts write 0.8 to mean 80%; anything above 1.0 is already on the
// 0-100 scale.
fn scale_fraction(value: f64) -> f64 {
    if value <= 1.0 {
        value * 100.0
    } else {
        value
    }
}

/// Convert a raw cell to a completion percentage on the 0-100 scale.
/// Strings carrying a '%' are parsed by stripping the symbol and are never
/// rescaled. Missing or unparsable input collapses to 0.0.
fn normalize_avance(cell: &Data) -> f64 {
    let value = match cell {
        Data::Float(f) => scale_fraction(*f),
        Data::Int(i) => scale_fraction(*i as f64),
        Data::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                0.0
            } else if s.contains('%') {
                s.replace('%', "").trim().parse().unwrap_or(0.0)
            } else {
                s.parse().map(scale_fraction).unwrap_or(0.0)
            }
        }
        _ => 0.0,
    };

    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Cell content as trimmed text; empty and error cells become ""
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.trim().to_string(),
        Data::Empty | Data::Error(_) => String::new(),
        other => format!("{}", other).trim().to_string(),
    }
}

fn is_blank(cell: &Data) -> bool {
    cell_text(cell).is_empty()
}

// =============================================================================
// COLUMN MAPPING - translates the extract's human-authored headers
// =============================================================================

/// Exact header renames, as they appear in the extract. Headers are trimmed
/// before comparison, so trailing spaces in the source don't matter.
const COLUMN_RENAMES: &[(&str, &str)] = &[
    ("Proceso / SP", "codigo_area"),
    ("Description of the Activity\n(BACKLOG)", "descripcion"),
    ("Responsable del Éxito\nProcess owner", "responsable"),
    ("Fecha de Entrega\nEnd Date", "fecha_entrega"),
    ("Fecha de Compromiso\nDeliver Date", "fecha_compromiso"),
    ("Origin Date", "fecha_origen"),
    ("Evidencia del Control", "evidencia"),
    ("Status", "estado"),
    ("% Avance", "avance"),
    ("Observaciones", "observaciones"),
];

/// Marker used to locate the description column when the exact header
/// doesn't match (line breaks inside headers get mangled between exports)
const DESCRIPTION_MARKER: &str = "BACKLOG";

#[derive(Debug)]
struct ColumnMap {
    descripcion: usize,
    codigo_area: Option<usize>,
    responsable: Option<usize>,
    fecha_origen: Option<usize>,
    fecha_compromiso: Option<usize>,
    fecha_entrega: Option<usize>,
    evidencia: Option<usize>,
    estado: Option<usize>,
    avance: Option<usize>,
    observaciones: Option<usize>,
}

/// Map header text to canonical column positions. The description column is
/// the only required one; a source without it cannot be imported.
fn map_columns(headers: &[String]) -> Result<ColumnMap> {
    let mut canonical: HashMap<&'static str, usize> = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        let trimmed = header.trim();
        for (source, canon) in COLUMN_RENAMES {
            if trimmed == *source && !canonical.contains_key(canon) {
                canonical.insert(canon, idx);
            }
        }
    }

    let descripcion = match canonical.get("descripcion") {
        Some(&idx) => idx,
        None => headers
            .iter()
            .position(|h| h.contains(DESCRIPTION_MARKER))
            .with_context(|| {
                format!(
                    "AMBIGUITY: no description column found (no exact header match, no '{}' marker)",
                    DESCRIPTION_MARKER
                )
            })?,
    };

    Ok(ColumnMap {
        descripcion,
        codigo_area: canonical.get("codigo_area").copied(),
        responsable: canonical.get("responsable").copied(),
        fecha_origen: canonical.get("fecha_origen").copied(),
        fecha_compromiso: canonical.get("fecha_compromiso").copied(),
        fecha_entrega: canonical.get("fecha_entrega").copied(),
        evidencia: canonical.get("evidencia").copied(),
        estado: canonical.get("estado").copied(),
        avance: canonical.get("avance").copied(),
        observaciones: canonical.get("observaciones").copied(),
    })
}

// =============================================================================
// ROW PROCESSING - one raw row to one importable draft, or a skip verdict
// =============================================================================

/// Storage contract for actividades.descripcion
const MAX_DESCRIPCION_CHARS: usize = 500;

/// Sentinel responsable for rows that don't name one
const UNASSIGNED: &str = "Sin Asignar";

static EMPTY_CELL: Data = Data::Empty;

fn cell<'a>(row: &'a [Data], idx: Option<usize>) -> &'a Data {
    idx.and_then(|i| row.get(i)).unwrap_or(&EMPTY_CELL)
}

/// An actividad ready for persistence, dimension references still unresolved
#[derive(Debug, Clone, PartialEq)]
struct ActivityDraft {
    /// 1-indexed sheet row, kept for skip reports and email synthesis
    source_row: usize,
    descripcion: String,
    codigo_area: String,
    responsable: String,
    fecha_origen: Option<NaiveDate>,
    fecha_compromiso: Option<NaiveDate>,
    fecha_entrega_real: Option<NaiveDate>,
    avance: f64,
    estado: Estado,
    link_evidencia: String,
    observaciones: String,
}

/// Build one draft from a raw row. The description and the area code are the
/// only hard gates; everything else defaults.
fn build_draft(
    row: &[Data],
    columns: &ColumnMap,
    source_row: usize,
) -> Result<ActivityDraft, &'static str> {
    let descripcion = cell_text(cell(row, Some(columns.descripcion)));
    if descripcion.is_empty() {
        return Err("missing description");
    }

    let codigo_area = cell_text(cell(row, columns.codigo_area));
    if codigo_area.is_empty() {
        return Err("missing area code");
    }

    let responsable = {
        let name = cell_text(cell(row, columns.responsable));
        if name.is_empty() {
            UNASSIGNED.to_string()
        } else {
            name
        }
    };

    Ok(ActivityDraft {
        source_row,
        // Over-length text is cut silently; the storage contract wins.
        descripcion: descripcion.chars().take(MAX_DESCRIPCION_CHARS).collect(),
        codigo_area,
        responsable,
        fecha_origen: normalize_date(cell(row, columns.fecha_origen)),
        fecha_compromiso: normalize_date(cell(row, columns.fecha_compromiso)),
        fecha_entrega_real: normalize_date(cell(row, columns.fecha_entrega)),
        avance: normalize_avance(cell(row, columns.avance)),
        estado: Estado::from_raw(&cell_text(cell(row, columns.estado))),
        link_evidencia: cell_text(cell(row, columns.evidencia)),
        observaciones: cell_text(cell(row, columns.observaciones)),
    })
}

#[derive(Debug)]
struct DraftBatch {
    drafts: Vec<ActivityDraft>,
    rows_read: usize,
    skipped: Vec<(usize, &'static str)>,
}

/// Run the pure draft pass over all data rows.
/// This function is DETERMINISTIC: same rows = same drafts
fn build_drafts(data_rows: &[Vec<Data>], columns: &ColumnMap, first_row: usize) -> DraftBatch {
    let mut drafts = Vec::new();
    let mut skipped = Vec::new();

    for (offset, row) in data_rows.iter().enumerate() {
        let source_row = first_row + offset;

        // Spreadsheet ranges run past the data; drop fully empty rows before
        // the per-field gates.
        if row.iter().all(is_blank) {
            skipped.push((source_row, "empty row"));
            continue;
        }

        match build_draft(row, columns, source_row) {
            Ok(draft) => drafts.push(draft),
            Err(reason) => skipped.push((source_row, reason)),
        }
    }

    DraftBatch {
        rows_read: data_rows.len(),
        drafts,
        skipped,
    }
}

// =============================================================================
// SOURCE READING
// =============================================================================

fn is_excel_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("xlsx" | "xls" | "xlsb" | "ods")
    )
}

fn read_excel_rows(path: &Path) -> Result<Vec<Vec<Data>>> {
    let mut workbook: calamine::Sheets<_> =
        open_workbook_auto(path).context("Failed to open workbook")?;

    let sheet_names = workbook.sheet_names();
    let sheet_name = sheet_names
        .first()
        .context("Workbook has no sheets")?
        .clone();

    let range = workbook
        .worksheet_range(&sheet_name)
        .context("Failed to read sheet")?;

    let (row_count, col_count) = range.get_size();
    println!("Sheet '{}': {} rows x {} columns", sheet_name, row_count, col_count);

    Ok(range.rows().map(|r| r.to_vec()).collect())
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            // Legacy extracts arrive as Windows-1252.
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

async fn read_csv_rows(path: &Path) -> Result<Vec<Vec<Data>>> {
    let bytes = fs::read(path).await.context("Failed to read source file")?;
    let text = decode_text(&bytes);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .has_headers(false)
        .from_reader(text.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("CSV parse error")?;
        rows.push(
            record
                .iter()
                .map(|field| {
                    if field.is_empty() {
                        Data::Empty
                    } else {
                        Data::String(field.to_string())
                    }
                })
                .collect(),
        );
    }

    Ok(rows)
}

/// Read the source, skip the junk rows above the header, remap columns and
/// run the pure draft pass.
async fn load_drafts(config: &Config) -> Result<DraftBatch> {
    println!("Reading {}...", config.source_file.display());

    let all_rows = if is_excel_file(&config.source_file) {
        read_excel_rows(&config.source_file)?
    } else {
        read_csv_rows(&config.source_file).await?
    };

    // The extract carries a fixed block of title/logo rows above the header.
    if all_rows.len() <= config.skip_rows {
        anyhow::bail!(
            "Source has no header row after skipping {} rows",
            config.skip_rows
        );
    }

    let headers: Vec<String> = all_rows[config.skip_rows].iter().map(cell_text).collect();
    let columns = map_columns(&headers)?;
    let data_rows = &all_rows[config.skip_rows + 1..];

    // 1-indexed sheet row of the first data row
    let first_row = config.skip_rows + 2;
    let batch = build_drafts(data_rows, &columns, first_row);

    println!(
        "Processed {} rows: {} drafts, {} skipped",
        batch.rows_read,
        batch.drafts.len(),
        batch.skipped.len()
    );

    Ok(batch)
}

// =============================================================================
// DIMENSION RESOLUTION - get-or-create over natural keys
// =============================================================================
// Check-then-insert is not atomic across concurrent runs; the schema's
// unique constraints are the backstop. Creations run on the pool, outside
// the fact transaction, so later rows in the run observe them immediately.
// =============================================================================

/// Get or create the empresa by razon_social, returning empresa_id
async fn get_or_create_empresa(pool: &PgPool, razon_social: &str, ruc: &str) -> Result<Uuid> {
    let existing: Option<(Uuid,)> =
        sqlx::query_as("SELECT empresa_id FROM empresas WHERE razon_social = $1")
            .bind(razon_social)
            .fetch_optional(pool)
            .await?;

    if let Some((id,)) = existing {
        return Ok(id);
    }

    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO empresas (empresa_id, razon_social, ruc) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(razon_social)
        .bind(ruc)
        .execute(pool)
        .await?;

    println!("Registered empresa '{}'", razon_social);
    Ok(id)
}

/// Get or create an area by its natural key (empresa, codigo)
async fn get_or_create_area(pool: &PgPool, empresa_id: Uuid, codigo: &str) -> Result<Uuid> {
    let existing: Option<(Uuid,)> =
        sqlx::query_as("SELECT area_id FROM areas WHERE empresa_id = $1 AND codigo = $2")
            .bind(empresa_id)
            .bind(codigo)
            .fetch_optional(pool)
            .await?;

    if let Some((id,)) = existing {
        return Ok(id);
    }

    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO areas (area_id, empresa_id, codigo, nombre) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(empresa_id)
        .bind(codigo)
        .bind(format!("Área {}", codigo))
        .execute(pool)
        .await?;

    Ok(id)
}

/// Email synthesized for auto-created usuarios: first name token plus the
/// source row ordinal, unique and stable across re-runs of the same extract
fn synth_email(nombre: &str, source_row: usize, domain: &str) -> String {
    let first = nombre
        .split_whitespace()
        .next()
        .unwrap_or("usuario")
        .to_lowercase();
    format!("{}_{}@{}", first, source_row, domain)
}

/// Get or create a usuario by display name
async fn get_or_create_usuario(
    pool: &PgPool,
    nombre: &str,
    empresa_id: Uuid,
    source_row: usize,
    config: &Config,
) -> Result<Uuid> {
    let existing: Option<(Uuid,)> =
        sqlx::query_as("SELECT usuario_id FROM usuarios WHERE nombre_completo = $1")
            .bind(nombre)
            .fetch_optional(pool)
            .await?;

    if let Some((id,)) = existing {
        return Ok(id);
    }

    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO usuarios (usuario_id, nombre_completo, email, password_hash, rol, empresa_id)
        VALUES ($1, $2, $3, $4, 'CONSULTOR', $5)
        "#,
    )
    .bind(id)
    .bind(nombre)
    .bind(synth_email(nombre, source_row, &config.email_domain))
    .bind(&config.placeholder_password)
    .bind(empresa_id)
    .execute(pool)
    .await?;

    Ok(id)
}

// =============================================================================
// PERSISTENCE
// =============================================================================

async fn insert_activity(
    tx: &mut Transaction<'_, Postgres>,
    empresa_id: Uuid,
    area_id: Uuid,
    responsable_id: Uuid,
    draft: &ActivityDraft,
) -> Result<Uuid> {
    let actividad_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO actividades
        (actividad_id, empresa_id, area_id, responsable_id, descripcion,
         fecha_origen, fecha_compromiso, fecha_entrega_real, avance, estado,
         link_evidencia, observaciones)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(actividad_id)
    .bind(empresa_id)
    .bind(area_id)
    .bind(responsable_id)
    .bind(&draft.descripcion)
    .bind(draft.fecha_origen)
    .bind(draft.fecha_compromiso)
    .bind(draft.fecha_entrega_real)
    .bind(draft.avance)
    .bind(draft.estado.as_str())
    .bind(&draft.link_evidencia)
    .bind(&draft.observaciones)
    .execute(&mut **tx)
    .await?;

    Ok(actividad_id)
}

/// Create job run for the importer
async fn create_job_run(pool: &PgPool, source: &str) -> Result<Uuid> {
    let job_run_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO job_runs (job_run_id, component, source_id, status, detail)
        VALUES ($1, 'importer', $2, 'running', '{}')
        "#,
    )
    .bind(job_run_id)
    .bind(source)
    .execute(pool)
    .await?;
    Ok(job_run_id)
}

/// Finish job run
async fn finish_job_run(
    pool: &PgPool,
    job_run_id: Uuid,
    status: &str,
    error: Option<&str>,
    detail: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE job_runs
        SET finished_at = now(), status = $2, error = $3, detail = detail || $4
        WHERE job_run_id = $1
        "#,
    )
    .bind(job_run_id)
    .bind(status)
    .bind(error)
    .bind(detail)
    .execute(pool)
    .await?;
    Ok(())
}

// =============================================================================
// BATCH IMPORT RUN
// =============================================================================

fn print_sample(batch: &DraftBatch) {
    for draft in batch.drafts.iter().take(3) {
        println!(
            "  [row {}] {} | {} | {:.1}% | {}",
            draft.source_row,
            draft.codigo_area,
            draft.descripcion.chars().take(40).collect::<String>(),
            draft.avance,
            draft.estado.as_str()
        );
    }
    if batch.drafts.len() > 3 {
        println!("  ... and {} more", batch.drafts.len() - 3);
    }
}

fn print_skips(skipped: &[(usize, &'static str)]) {
    if skipped.is_empty() {
        return;
    }
    // BTreeMap for stable output order
    let mut reasons: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, reason) in skipped {
        *reasons.entry(reason).or_default() += 1;
    }
    println!("Skipped {} rows:", skipped.len());
    for (reason, count) in &reasons {
        println!("  {} x {}", count, reason);
    }
}

async fn run_import(pool: &PgPool, config: &Config, dry_run: bool) -> Result<ImportSummary> {
    if dry_run {
        let batch = load_drafts(config).await?;
        print_sample(&batch);
        print_skips(&batch.skipped);
        println!("\nDry run - nothing written to the database");
        return Ok(ImportSummary {
            rows_read: batch.rows_read,
            rows_imported: 0,
            rows_skipped: batch.skipped.len(),
        });
    }

    // The empresa for the run: the extract carries no empresa identity per
    // row, so everything lands under the configured one.
    let empresa_id =
        get_or_create_empresa(pool, &config.default_empresa, &config.default_ruc).await?;

    let batch = load_drafts(config).await?;

    // Per-run caches so each natural key hits the database once
    let mut area_cache: HashMap<String, Uuid> = HashMap::new();
    let mut usuario_cache: HashMap<String, Uuid> = HashMap::new();

    let mut skipped = batch.skipped;
    let mut imported = 0usize;

    // Dimension rows persist immediately; the facts commit together at the
    // end, so an aborted run leaves no partial activities behind.
    let mut tx = pool.begin().await?;

    for draft in &batch.drafts {
        let area_id = if let Some(&id) = area_cache.get(&draft.codigo_area) {
            id
        } else {
            match get_or_create_area(pool, empresa_id, &draft.codigo_area).await {
                Ok(id) => {
                    area_cache.insert(draft.codigo_area.clone(), id);
                    id
                }
                Err(e) => {
                    eprintln!(
                        "  row {}: area '{}' resolution failed: {}",
                        draft.source_row, draft.codigo_area, e
                    );
                    skipped.push((draft.source_row, "area resolution failed"));
                    continue;
                }
            }
        };

        let responsable_id = if let Some(&id) = usuario_cache.get(&draft.responsable) {
            id
        } else {
            match get_or_create_usuario(pool, &draft.responsable, empresa_id, draft.source_row, config)
                .await
            {
                Ok(id) => {
                    usuario_cache.insert(draft.responsable.clone(), id);
                    id
                }
                Err(e) => {
                    eprintln!(
                        "  row {}: responsable '{}' resolution failed: {}",
                        draft.source_row, draft.responsable, e
                    );
                    skipped.push((draft.source_row, "responsable resolution failed"));
                    continue;
                }
            }
        };

        insert_activity(&mut tx, empresa_id, area_id, responsable_id, draft).await?;
        imported += 1;
    }

    println!("Committing...");
    tx.commit()
        .await
        .context("Failed to commit import transaction")?;

    print_skips(&skipped);

    Ok(ImportSummary {
        rows_read: batch.rows_read,
        rows_imported: imported,
        rows_skipped: skipped.len(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(file) = args.file {
        config.source_file = file;
    }
    if let Some(empresa) = args.empresa {
        config.default_empresa = empresa;
    }

    println!("=== Actividades Importer ===");
    println!("Source: {}", config.source_file.display());
    println!("Empresa: {}", config.default_empresa);
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.db_url)
        .await
        .context("Failed to connect to database")?;

    let source_label = config.source_file.display().to_string();
    let job_run_id = if !args.dry_run {
        Some(create_job_run(&pool, &source_label).await?)
    } else {
        None
    };

    let result = run_import(&pool, &config, args.dry_run).await;

    if let Some(job_id) = job_run_id {
        match &result {
            Ok(summary) => {
                finish_job_run(&pool, job_id, "ok", None, serde_json::to_value(summary)?).await?
            }
            Err(e) => {
                finish_job_run(
                    &pool,
                    job_id,
                    "failed",
                    Some(&e.to_string()),
                    serde_json::json!({}),
                )
                .await?
            }
        }
    }

    let summary = result?;
    println!("\n=== Import Complete ===");
    println!("Rows read:     {}", summary.rows_read);
    println!("Rows imported: {}", summary.rows_imported);
    println!("Rows skipped:  {}", summary.rows_skipped);

    Ok(())
}

// =============================================================================
// TESTS - Critical for ensuring DETERMINISM
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{ExcelDateTime, ExcelDateTimeType};
    use chrono::Datelike;

    fn s(text: &str) -> Data {
        Data::String(text.to_string())
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    // -------------------------------------------------------------------------
    // DATE NORMALIZATION TESTS - day-first, never swapped
    // -------------------------------------------------------------------------

    #[test]
    fn test_date_day_first() {
        let parsed = normalize_date(&s("05/03/2024")).unwrap();
        assert_eq!(parsed.day(), 5);
        assert_eq!(parsed.month(), 3);
        assert_eq!(parsed.year(), 2024);
    }

    #[test]
    fn test_date_day_first_never_swapped() {
        // 03/05 is the 3rd of May, not March 5th
        assert_eq!(normalize_date(&s("03/05/2024")), Some(date(2024, 5, 3)));
    }

    #[test]
    fn test_date_dash_separator() {
        assert_eq!(normalize_date(&s("05-03-2024")), Some(date(2024, 3, 5)));
    }

    #[test]
    fn test_date_two_digit_year() {
        assert_eq!(normalize_date(&s("05/03/24")), Some(date(2024, 3, 5)));
    }

    #[test]
    fn test_date_iso() {
        assert_eq!(normalize_date(&s("2024-03-05")), Some(date(2024, 3, 5)));
    }

    #[test]
    fn test_date_with_time_suffix() {
        assert_eq!(
            normalize_date(&s("05/03/2024 00:00:00")),
            Some(date(2024, 3, 5))
        );
    }

    #[test]
    fn test_date_empty_is_none() {
        assert_eq!(normalize_date(&Data::Empty), None);
        assert_eq!(normalize_date(&s("")), None);
        assert_eq!(normalize_date(&s("   ")), None);
    }

    #[test]
    fn test_date_garbage_is_none() {
        assert_eq!(normalize_date(&s("pendiente")), None);
        assert_eq!(normalize_date(&s("32/13/2024")), None);
    }

    #[test]
    fn test_date_numeric_cell_is_none() {
        // Raw numbers are not dates; dates arrive typed or as text
        assert_eq!(normalize_date(&Data::Float(45356.0)), None);
    }

    #[test]
    fn test_date_excel_datetime_cell() {
        // Serial 45356 = 2024-03-05
        let cell = Data::DateTime(ExcelDateTime::new(
            45356.0,
            ExcelDateTimeType::DateTime,
            false,
        ));
        assert_eq!(normalize_date(&cell), Some(date(2024, 3, 5)));
    }

    #[test]
    fn test_date_iso_datetime_cell() {
        let cell = Data::DateTimeIso("2024-03-05T00:00:00".to_string());
        assert_eq!(normalize_date(&cell), Some(date(2024, 3, 5)));
    }

    // -------------------------------------------------------------------------
    // AVANCE NORMALIZATION TESTS - fraction/percent dual scale
    // -------------------------------------------------------------------------

    #[test]
    fn test_avance_fraction_scales() {
        assert_eq!(normalize_avance(&Data::Float(0.8)), 80.0);
        assert_eq!(normalize_avance(&Data::Float(0.25)), 25.0);
    }

    #[test]
    fn test_avance_one_is_a_fraction() {
        // Preserved heuristic: 1.0 reads as 100%, not 1%
        assert_eq!(normalize_avance(&Data::Float(1.0)), 100.0);
    }

    #[test]
    fn test_avance_above_one_passes_through() {
        assert_eq!(normalize_avance(&Data::Float(45.0)), 45.0);
        assert_eq!(normalize_avance(&Data::Int(45)), 45.0);
    }

    #[test]
    fn test_avance_percent_string_unscaled() {
        assert_eq!(normalize_avance(&s("45%")), 45.0);
        assert_eq!(normalize_avance(&s("45 %")), 45.0);
    }

    #[test]
    fn test_avance_percent_string_below_one_not_rescaled() {
        assert_eq!(normalize_avance(&s("0.8%")), 0.8);
    }

    #[test]
    fn test_avance_numeric_string_scales() {
        assert_eq!(normalize_avance(&s("0.8")), 80.0);
        assert_eq!(normalize_avance(&s("80")), 80.0);
    }

    #[test]
    fn test_avance_missing_is_zero() {
        assert_eq!(normalize_avance(&Data::Empty), 0.0);
        assert_eq!(normalize_avance(&s("")), 0.0);
        assert_eq!(normalize_avance(&s("n/a")), 0.0);
    }

    #[test]
    fn test_avance_clamped_to_range() {
        assert_eq!(normalize_avance(&Data::Float(150.0)), 100.0);
        assert_eq!(normalize_avance(&s("150%")), 100.0);
        assert_eq!(normalize_avance(&Data::Float(-0.25)), 0.0);
    }

    // -------------------------------------------------------------------------
    // ESTADO NORMALIZATION TESTS - ordered substring rules
    // -------------------------------------------------------------------------

    #[test]
    fn test_estado_closed_variants() {
        assert_eq!(Estado::from_raw("closed out"), Estado::Cerrada);
        assert_eq!(Estado::from_raw("Cerrada"), Estado::Cerrada);
        assert_eq!(Estado::from_raw("CERRADA"), Estado::Cerrada);
    }

    #[test]
    fn test_estado_late_variants() {
        assert_eq!(Estado::from_raw("Atrasada"), Estado::Atrasada);
        assert_eq!(Estado::from_raw("delivered late"), Estado::Atrasada);
    }

    #[test]
    fn test_estado_blocked_variants() {
        assert_eq!(Estado::from_raw("Bloqueado"), Estado::Bloqueado);
        assert_eq!(Estado::from_raw("Blocked"), Estado::Bloqueado);
    }

    #[test]
    fn test_estado_default_is_abierta() {
        assert_eq!(Estado::from_raw("En Proceso"), Estado::Abierta);
        assert_eq!(Estado::from_raw(""), Estado::Abierta);
    }

    #[test]
    fn test_estado_first_rule_wins() {
        // "closed late" matches the closed rule before the late rule
        assert_eq!(Estado::from_raw("closed late"), Estado::Cerrada);
    }

    #[test]
    fn test_estado_store_values() {
        assert_eq!(Estado::Cerrada.as_str(), "Cerrada");
        assert_eq!(Estado::Abierta.as_str(), "Abierta");
        assert_eq!(Estado::Atrasada.as_str(), "Atrasada");
        assert_eq!(Estado::Bloqueado.as_str(), "Bloqueado");
    }

    // -------------------------------------------------------------------------
    // COLUMN MAPPING TESTS
    // -------------------------------------------------------------------------

    fn full_headers() -> Vec<String> {
        vec![
            "Proceso / SP".to_string(),
            "Description of the Activity\n(BACKLOG)".to_string(),
            "Responsable del Éxito\nProcess owner".to_string(),
            "Fecha de Entrega\nEnd Date".to_string(),
            "Fecha de Compromiso\nDeliver Date".to_string(),
            "Origin Date".to_string(),
            "Evidencia del Control ".to_string(),
            "Status".to_string(),
            "% Avance".to_string(),
        ]
    }

    #[test]
    fn test_map_columns_exact_headers() {
        let columns = map_columns(&full_headers()).unwrap();
        assert_eq!(columns.codigo_area, Some(0));
        assert_eq!(columns.descripcion, 1);
        assert_eq!(columns.responsable, Some(2));
        assert_eq!(columns.fecha_entrega, Some(3));
        assert_eq!(columns.fecha_compromiso, Some(4));
        assert_eq!(columns.fecha_origen, Some(5));
        assert_eq!(columns.evidencia, Some(6));
        assert_eq!(columns.estado, Some(7));
        assert_eq!(columns.avance, Some(8));
        assert_eq!(columns.observaciones, None);
    }

    #[test]
    fn test_map_columns_trailing_space_header() {
        // "Evidencia del Control " carries a trailing space in the extract
        let columns = map_columns(&full_headers()).unwrap();
        assert_eq!(columns.evidencia, Some(6));
    }

    #[test]
    fn test_map_columns_backlog_fallback() {
        // Re-exports mangle the line break inside the description header
        let headers = vec![
            "Proceso / SP".to_string(),
            "Description of the Activity (BACKLOG)".to_string(),
            "Status".to_string(),
        ];
        let columns = map_columns(&headers).unwrap();
        assert_eq!(columns.descripcion, 1);
    }

    #[test]
    fn test_map_columns_no_description_fails() {
        let headers = vec!["Proceso / SP".to_string(), "Status".to_string()];
        let result = map_columns(&headers);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("AMBIGUITY"));
    }

    #[test]
    fn test_map_columns_first_match_wins() {
        let headers = vec![
            "Status".to_string(),
            "Description of the Activity\n(BACKLOG)".to_string(),
            "Status".to_string(),
        ];
        let columns = map_columns(&headers).unwrap();
        assert_eq!(columns.estado, Some(0));
    }

    // -------------------------------------------------------------------------
    // DRAFT BUILDING TESTS
    // -------------------------------------------------------------------------

    fn sample_row() -> Vec<Data> {
        vec![
            s("ACD"),
            s("Review contract"),
            s("María García López"),
            s("10/04/2024"),
            s("05/03/2024"),
            s("01/02/2024"),
            s("https://drive.example/evidencia/1"),
            s("closed out"),
            Data::Float(0.8),
        ]
    }

    fn columns() -> ColumnMap {
        map_columns(&full_headers()).unwrap()
    }

    #[test]
    fn test_draft_missing_description_skips() {
        let mut row = sample_row();
        row[1] = Data::Empty;
        assert_eq!(
            build_draft(&row, &columns(), 9),
            Err("missing description")
        );
    }

    #[test]
    fn test_draft_whitespace_description_skips() {
        let mut row = sample_row();
        row[1] = s("   ");
        assert_eq!(
            build_draft(&row, &columns(), 9),
            Err("missing description")
        );
    }

    #[test]
    fn test_draft_missing_area_code_skips() {
        let mut row = sample_row();
        row[0] = Data::Empty;
        assert_eq!(build_draft(&row, &columns(), 9), Err("missing area code"));
    }

    #[test]
    fn test_draft_defaults_for_sparse_row() {
        // A row with a description and an area code still imports
        let row = vec![s("ATH"), s("Define onboarding checklist")];
        let draft = build_draft(&row, &columns(), 9).unwrap();
        assert_eq!(draft.responsable, UNASSIGNED);
        assert_eq!(draft.avance, 0.0);
        assert_eq!(draft.estado, Estado::Abierta);
        assert_eq!(draft.fecha_origen, None);
        assert_eq!(draft.fecha_compromiso, None);
        assert_eq!(draft.fecha_entrega_real, None);
        assert_eq!(draft.link_evidencia, "");
        assert_eq!(draft.observaciones, "");
    }

    #[test]
    fn test_draft_truncates_long_description() {
        let mut row = sample_row();
        // Multibyte chars make sure truncation counts characters, not bytes
        row[1] = s(&"á".repeat(600));
        let draft = build_draft(&row, &columns(), 9).unwrap();
        assert_eq!(draft.descripcion.chars().count(), MAX_DESCRIPCION_CHARS);
    }

    #[test]
    fn test_draft_evidencia_passthrough() {
        let draft = build_draft(&sample_row(), &columns(), 9).unwrap();
        assert_eq!(draft.link_evidencia, "https://drive.example/evidencia/1");
    }

    #[test]
    fn test_draft_acd_scenario() {
        // codigo_area "ACD", blank responsable, avance 0.8, estado "closed out"
        let mut row = sample_row();
        row[2] = s("");
        let draft = build_draft(&row, &columns(), 9).unwrap();
        assert_eq!(draft.codigo_area, "ACD");
        assert_eq!(draft.descripcion, "Review contract");
        assert_eq!(draft.responsable, "Sin Asignar");
        assert_eq!(draft.avance, 80.0);
        assert_eq!(draft.estado, Estado::Cerrada);
        assert_eq!(draft.estado.as_str(), "Cerrada");
    }

    #[test]
    fn test_draft_normalizes_dates_day_first() {
        let draft = build_draft(&sample_row(), &columns(), 9).unwrap();
        assert_eq!(draft.fecha_compromiso, Some(date(2024, 3, 5)));
        assert_eq!(draft.fecha_entrega_real, Some(date(2024, 4, 10)));
        assert_eq!(draft.fecha_origen, Some(date(2024, 2, 1)));
    }

    // -------------------------------------------------------------------------
    // DRAFT BATCH TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_batch_prefilters_empty_rows() {
        let rows = vec![
            sample_row(),
            vec![Data::Empty, Data::Empty, s("  ")],
            sample_row(),
        ];
        let batch = build_drafts(&rows, &columns(), 9);
        assert_eq!(batch.rows_read, 3);
        assert_eq!(batch.drafts.len(), 2);
        assert_eq!(batch.skipped, vec![(10, "empty row")]);
    }

    #[test]
    fn test_batch_source_row_numbering() {
        let rows = vec![sample_row(), sample_row()];
        let batch = build_drafts(&rows, &columns(), 9);
        assert_eq!(batch.drafts[0].source_row, 9);
        assert_eq!(batch.drafts[1].source_row, 10);
    }

    #[test]
    fn test_batch_counts_business_skips() {
        let mut no_area = sample_row();
        no_area[0] = Data::Empty;
        let rows = vec![sample_row(), no_area];
        let batch = build_drafts(&rows, &columns(), 9);
        assert_eq!(batch.drafts.len(), 1);
        assert_eq!(batch.skipped, vec![(10, "missing area code")]);
    }

    #[test]
    fn test_batch_determinism() {
        let rows = vec![sample_row(), sample_row(), sample_row()];
        let first = build_drafts(&rows, &columns(), 9);
        let second = build_drafts(&rows, &columns(), 9);
        assert_eq!(first.drafts, second.drafts);
        assert_eq!(first.skipped, second.skipped);
    }

    // -------------------------------------------------------------------------
    // EMAIL SYNTHESIS TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_email_first_token_plus_row() {
        assert_eq!(
            synth_email("María García López", 12, "consultora.local"),
            "maría_12@consultora.local"
        );
    }

    #[test]
    fn test_email_single_token_name() {
        assert_eq!(synth_email("Valeria", 3, "consultora.local"), "valeria_3@consultora.local");
    }

    #[test]
    fn test_email_unassigned_sentinel() {
        assert_eq!(
            synth_email(UNASSIGNED, 7, "consultora.local"),
            "sin_7@consultora.local"
        );
    }

    // -------------------------------------------------------------------------
    // SOURCE FORMAT DETECTION
    // -------------------------------------------------------------------------

    #[test]
    fn test_is_excel_file() {
        assert!(is_excel_file(Path::new("datos_scp.csv.xlsx")));
        assert!(is_excel_file(Path::new("extract.ods")));
        assert!(!is_excel_file(Path::new("extract.csv")));
        assert!(!is_excel_file(Path::new("extract")));
    }

    #[test]
    fn test_decode_text_windows_1252() {
        // "Área" in Windows-1252
        let bytes = [0xc1, b'r', b'e', b'a'];
        assert_eq!(decode_text(&bytes), "Área");
    }
}
