//! Integration tests for PDF and Office document ingestion through the CLI.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn dq_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.push("dq");
    path
}

/// Minimal valid PDF whose single page shows `phrase`.
/// Builds body then xref with correct byte offsets so pdf-extract can parse it.
fn minimal_pdf_with_text(phrase: &str) -> Vec<u8> {
    let content = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(
        format!(
            "4 0 obj << /Length {} >> stream\n{}\nendstream endobj\n",
            content.len(),
            content
        )
        .as_bytes(),
    );
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

fn zip_with(entries: &[(&str, String)]) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        for (name, body) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buf
}

fn minimal_docx_with_text(phrase: &str) -> Vec<u8> {
    zip_with(&[(
        "word/document.xml",
        format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
            phrase
        ),
    )])
}

fn minimal_pptx_with_slides(slides: &[&str]) -> Vec<u8> {
    let entries: Vec<(String, String)> = slides
        .iter()
        .enumerate()
        .map(|(i, text)| {
            (
                format!("ppt/slides/slide{}.xml", i + 1),
                format!(
                    "<?xml version=\"1.0\"?><p:sld xmlns:p=\"p\" xmlns:a=\"a\"><p:cSld><p:spTree><p:sp><p:txBody><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:txBody></p:sp></p:spTree></p:cSld></p:sld>",
                    text
                ),
            )
        })
        .collect();
    let refs: Vec<(&str, String)> = entries
        .iter()
        .map(|(n, b)| (n.as_str(), b.clone()))
        .collect();
    zip_with(&refs)
}

fn setup_env(files: &[(&str, Vec<u8>)]) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    for (name, bytes) in files {
        fs::write(files_dir.join(name), bytes).unwrap();
    }

    let config = format!(
        r#"[storage]
working_dir = "{root}/rag_storage"

[parser]
output_dir = "{root}/output"

[llm]
provider = "disabled"

[embedding]
provider = "disabled"
"#,
        root = root.display()
    );
    let config_path = root.join("docquery.toml");
    fs::write(&config_path, config).unwrap();
    (tmp, config_path)
}

fn run_dq(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = dq_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run dq binary at {:?}: {}", binary, e));
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn file(tmp: &TempDir, name: &str) -> String {
    tmp.path()
        .join("files")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

fn context_for(config_path: &Path, question: &str) -> String {
    let (stdout, stderr, success) = run_dq(
        config_path,
        &["query", question, "--mode", "keyword", "--context-only"],
    );
    assert!(success, "query failed: stderr={}", stderr);
    stdout
}

#[test]
fn pdf_text_layer_is_indexed() {
    let (tmp, config_path) = setup_env(&[("paper.pdf", minimal_pdf_with_text("attention heads phrase"))]);

    let (stdout, stderr, success) = run_dq(&config_path, &["ingest", &file(&tmp, "paper.pdf")]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);

    let context = context_for(&config_path, "attention");
    assert!(context.starts_with("[1] paper.pdf #0"), "{}", context);
    assert!(context.contains("attention heads phrase"));

    let content_list = tmp
        .path()
        .join("output")
        .join("paper")
        .join("paper_content_list.json");
    let blocks: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(content_list).unwrap()).unwrap();
    assert_eq!(blocks[0]["type"], "text");
}

#[test]
fn ocr_method_is_rejected_and_recorded() {
    let (tmp, config_path) = setup_env(&[("scan.pdf", minimal_pdf_with_text("scanned"))]);

    let (_, stderr, success) = run_dq(
        &config_path,
        &["ingest", &file(&tmp, "scan.pdf"), "--method", "ocr"],
    );
    assert!(!success);
    assert!(stderr.contains("OCR"), "{}", stderr);

    let (stdout, _, _) = run_dq(&config_path, &["status", "--json", "--state", "failed"]);
    let records: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(records.as_array().unwrap().len(), 1);

    // txt reads the text layer, and the failed record is replaced
    let (_, stderr, success) = run_dq(
        &config_path,
        &["ingest", &file(&tmp, "scan.pdf"), "--method", "txt"],
    );
    assert!(success, "{}", stderr);
    let (stdout, _, _) = run_dq(&config_path, &["status", "--json", "--state", "processed"]);
    let records: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(records.as_array().unwrap().len(), 1);
}

#[test]
fn unknown_device_is_rejected() {
    let (tmp, config_path) = setup_env(&[("paper.pdf", minimal_pdf_with_text("device check"))]);
    let (_, stderr, success) = run_dq(
        &config_path,
        &["ingest", &file(&tmp, "paper.pdf"), "--device", "tpu"],
    );
    assert!(!success);
    assert!(stderr.contains("invalid device"));
}

#[test]
fn docx_paragraphs_are_indexed() {
    let (tmp, config_path) = setup_env(&[("report.docx", minimal_docx_with_text("office test phrase"))]);

    let (_, stderr, success) = run_dq(&config_path, &["ingest", &file(&tmp, "report.docx")]);
    assert!(success, "{}", stderr);

    let context = context_for(&config_path, "office phrase");
    assert!(context.contains("report.docx"));
    assert!(context.contains("office test phrase"));
}

#[test]
fn pptx_slides_are_indexed_in_order() {
    let (tmp, config_path) = setup_env(&[(
        "deck.pptx",
        minimal_pptx_with_slides(&["opening slide words", "closing slide words"]),
    )]);

    let (_, stderr, success) = run_dq(&config_path, &["ingest", &file(&tmp, "deck.pptx")]);
    assert!(success, "{}", stderr);

    let context = context_for(&config_path, "slide");
    let opening = context.find("opening slide words").unwrap();
    let closing = context.find("closing slide words").unwrap();
    assert!(opening < closing);
}

#[test]
fn unsupported_extension_fails() {
    let (tmp, config_path) = setup_env(&[("image.png", vec![0x89, b'P', b'N', b'G'])]);
    let (_, stderr, success) = run_dq(&config_path, &["ingest", &file(&tmp, "image.png")]);
    assert!(!success);
    assert!(stderr.contains("unsupported document format"));
}
