use html_escape::{encode_double_quoted_attribute, encode_text};
use serde::Serialize;

use crate::config_store::ConfigStore;

/// Form choices offered by the page.
#[derive(Debug, Clone, Serialize)]
pub struct UiOptions {
    pub max_images: usize,
    pub default_count: usize,
    pub aspect_ratios: Vec<String>,
    pub default_aspect_ratio: String,
    pub example_prompts: Vec<String>,
}

impl UiOptions {
    pub fn from_config(config: &ConfigStore) -> Self {
        Self {
            max_images: config.max_images(),
            default_count: config.default_count(),
            aspect_ratios: config.aspect_ratios(),
            default_aspect_ratio: config.default_aspect_ratio(),
            example_prompts: config.example_prompts(),
        }
    }
}

pub fn build_main_ui_html(options: &UiOptions) -> String {
    MAIN_UI_HTML
        .replace("{{COUNT_OPTIONS}}", &count_options(options))
        .replace("{{RATIO_OPTIONS}}", &ratio_options(options))
        .replace("{{EXAMPLE_PROMPTS}}", &example_prompts_json(options))
}

fn count_options(options: &UiOptions) -> String {
    (1..=options.max_images)
        .map(|count| {
            let selected = if count == options.default_count {
                " selected"
            } else {
                ""
            };
            let noun = if count == 1 { "Image" } else { "Images" };
            format!("<option value=\"{count}\"{selected}>{count} {noun}</option>")
        })
        .collect::<Vec<String>>()
        .join("\n          ")
}

fn ratio_options(options: &UiOptions) -> String {
    options
        .aspect_ratios
        .iter()
        .map(|ratio| {
            let selected = if *ratio == options.default_aspect_ratio {
                " selected"
            } else {
                ""
            };
            format!(
                "<option value=\"{}\"{}>{}</option>",
                encode_double_quoted_attribute(ratio),
                selected,
                encode_text(&ratio_label(ratio))
            )
        })
        .collect::<Vec<String>>()
        .join("\n          ")
}

fn ratio_label(ratio: &str) -> String {
    let shape = match ratio.split_once('/') {
        Some((w, h)) if w == h => "Square",
        Some((w, h)) => match (w.parse::<f64>(), h.parse::<f64>()) {
            (Ok(w), Ok(h)) if w > h => "Landscape",
            (Ok(_), Ok(_)) => "Portrait",
            _ => "",
        },
        None => "",
    };
    let display = ratio.replace('/', ":");
    if shape.is_empty() {
        display
    } else {
        format!("{shape} ({display})")
    }
}

/// JSON array safe to inline inside a `<script>` element.
fn example_prompts_json(options: &UiOptions) -> String {
    serde_json::to_string(&options.example_prompts)
        .unwrap_or_else(|_| "[]".to_string())
        .replace("</", "<\\/")
}

const MAIN_UI_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1" />
  <title>AI Image Generator</title>
  <style>
    :root {
      --bg: #e9e9f4;
      --panel: #ffffff;
      --line: #dcdce8;
      --text: #1e1e2a;
      --muted: #646478;
      --accent: #7c5dfa;
      --accent-hover: #6a4ae8;
      --card-bg: #f2f2fa;
      --error: #d6455d;
    }
    body.dark-theme {
      --bg: #14141c;
      --panel: #1d1d28;
      --line: #2f2f40;
      --text: #eeeef6;
      --muted: #9c9cb4;
      --card-bg: #262634;
    }
    * { box-sizing: border-box; }
    body {
      margin: 0;
      min-height: 100vh;
      padding: 24px;
      color: var(--text);
      background: var(--bg);
      font-family: "Segoe UI", "Helvetica Neue", sans-serif;
      transition: background 0.2s, color 0.2s;
    }
    .container {
      max-width: 960px;
      margin: 0 auto;
      padding: 28px;
      border-radius: 18px;
      background: var(--panel);
      border: 1px solid var(--line);
    }
    .header {
      display: flex;
      align-items: center;
      justify-content: space-between;
      margin-bottom: 20px;
    }
    .header h1 { margin: 0; font-size: 22px; }
    .theme-toggle, .prompt-btn {
      border: 1px solid var(--line);
      background: var(--card-bg);
      color: var(--text);
      border-radius: 50%;
      width: 40px;
      height: 40px;
      cursor: pointer;
      font-size: 18px;
    }
    .prompt-wrapper { position: relative; }
    .prompt-input {
      width: 100%;
      min-height: 120px;
      resize: vertical;
      padding: 14px 56px 14px 14px;
      border-radius: 12px;
      border: 1px solid var(--line);
      background: var(--card-bg);
      color: var(--text);
      font: inherit;
    }
    .prompt-btn { position: absolute; right: 10px; bottom: 14px; }
    .prompt-actions {
      display: flex;
      gap: 12px;
      margin-top: 14px;
      flex-wrap: wrap;
    }
    .select-wrapper select {
      height: 44px;
      padding: 0 14px;
      border-radius: 10px;
      border: 1px solid var(--line);
      background: var(--card-bg);
      color: var(--text);
      font: inherit;
    }
    .generate-btn {
      margin-left: auto;
      height: 44px;
      padding: 0 26px;
      border: none;
      border-radius: 10px;
      background: var(--accent);
      color: #ffffff;
      font: inherit;
      font-weight: 600;
      cursor: pointer;
    }
    .generate-btn:hover { background: var(--accent-hover); }
    .generate-btn:disabled { opacity: 0.6; cursor: not-allowed; }
    .status-line { min-height: 20px; margin-top: 10px; color: var(--error); font-size: 13px; }
    .gallery-grid {
      display: grid;
      grid-template-columns: repeat(auto-fill, minmax(200px, 1fr));
      gap: 16px;
      margin-top: 20px;
    }
    .img-card {
      position: relative;
      overflow: hidden;
      border-radius: 14px;
      background: var(--card-bg);
      border: 1px solid var(--line);
      display: flex;
      align-items: center;
      justify-content: center;
    }
    .result-img { width: 100%; height: 100%; object-fit: cover; display: block; }
    .status-container {
      display: flex;
      flex-direction: column;
      align-items: center;
      gap: 10px;
      color: var(--muted);
      font-size: 13px;
      padding: 12px;
      text-align: center;
    }
    .spinner {
      width: 34px;
      height: 34px;
      border-radius: 50%;
      border: 3px solid var(--line);
      border-top-color: var(--accent);
      animation: spin 0.9s linear infinite;
    }
    .img-card.error .status-container { color: var(--error); }
    .error-icon { font-size: 28px; }
    .img-overlay {
      position: absolute;
      inset: auto 0 0 0;
      display: flex;
      justify-content: flex-end;
      padding: 10px;
      opacity: 0;
      transition: opacity 0.2s;
      background: linear-gradient(transparent, rgba(0, 0, 0, 0.55));
    }
    .img-card:hover .img-overlay { opacity: 1; }
    .img-download-button {
      width: 38px;
      height: 38px;
      border-radius: 50%;
      display: flex;
      align-items: center;
      justify-content: center;
      background: rgba(255, 255, 255, 0.85);
      color: #1e1e2a;
      text-decoration: none;
      font-size: 18px;
    }
    @keyframes spin { to { transform: rotate(360deg); } }
  </style>
</head>
<body>
  <div class="container">
    <header class="header">
      <h1>AI Image Generator</h1>
      <button type="button" class="theme-toggle" title="Toggle theme">&#9790;</button>
    </header>
    <form class="prompt-form">
      <div class="prompt-wrapper">
        <textarea class="prompt-input" placeholder="Describe your imagination in detail..." required></textarea>
        <button type="button" class="prompt-btn" title="Random example prompt">&#127922;</button>
      </div>
      <div class="prompt-actions">
        <div class="select-wrapper">
          <select id="count-select">
          {{COUNT_OPTIONS}}
          </select>
        </div>
        <div class="select-wrapper">
          <select id="ratio-select">
          {{RATIO_OPTIONS}}
          </select>
        </div>
        <button type="submit" class="generate-btn">Generate</button>
      </div>
      <div class="status-line" id="status"></div>
    </form>
    <section class="gallery-grid"></section>
  </div>

  <script>
    const EXAMPLE_PROMPTS = {{EXAMPLE_PROMPTS}};
    const POLL_INTERVAL_MS = 700;

    const themeToggle = document.querySelector(".theme-toggle");
    const promptForm = document.querySelector(".prompt-form");
    const promptInput = document.querySelector(".prompt-input");
    const promptBtn = document.querySelector(".prompt-btn");
    const generateBtn = document.querySelector(".generate-btn");
    const countSelect = document.getElementById("count-select");
    const ratioSelect = document.getElementById("ratio-select");
    const galleryGrid = document.querySelector(".gallery-grid");

    const state = { revision: -1, batchId: 0, busy: false, polling: false };

    function setStatus(message) {
      document.getElementById("status").textContent = message || "";
    }

    async function apiGet(path) {
      const res = await fetch(path, { method: "GET" });
      const data = await res.json();
      if (!res.ok || !data.ok) {
        throw new Error(data.error || "request failed");
      }
      return data;
    }

    async function apiPost(path, body) {
      const res = await fetch(path, {
        method: "POST",
        headers: { "Content-Type": "application/json" },
        body: JSON.stringify(body || {}),
      });
      const data = await res.json();
      if (!res.ok || !data.ok) {
        throw new Error(data.error || "request failed");
      }
      return data;
    }

    function buildCard(slot, gallery) {
      const card = document.createElement("div");
      card.className = `img-card ${slot.state}`;
      card.id = `img-card-${slot.index}`;
      card.style.aspectRatio = gallery.aspect_ratio;

      if (slot.state === "ready") {
        const src = `/image?batch_id=${gallery.batch_id}&index=${slot.index}`;
        const img = document.createElement("img");
        img.className = "result-img";
        img.alt = "Generated Image";
        img.src = src;

        const overlay = document.createElement("div");
        overlay.className = "img-overlay";
        const link = document.createElement("a");
        link.className = "img-download-button";
        link.href = `${src}&download=1`;
        link.download = slot.file_name || `${Date.now()}.png`;
        link.title = "Download";
        link.textContent = "⬇";
        overlay.appendChild(link);

        card.appendChild(img);
        card.appendChild(overlay);
        return card;
      }

      const status = document.createElement("div");
      status.className = "status-container";
      if (slot.state === "loading") {
        const spinner = document.createElement("div");
        spinner.className = "spinner";
        status.appendChild(spinner);
      } else {
        const icon = document.createElement("div");
        icon.className = "error-icon";
        icon.textContent = "⚠";
        status.appendChild(icon);
        card.title = slot.error || "";
      }
      const text = document.createElement("p");
      text.className = "status-text";
      text.textContent = slot.status_text;
      status.appendChild(text);
      card.appendChild(status);
      return card;
    }

    function applyGallery(gallery) {
      state.busy = !!gallery.busy;
      generateBtn.disabled = state.busy;
      if (gallery.revision === state.revision) {
        return;
      }
      state.revision = gallery.revision;
      state.batchId = gallery.batch_id;

      galleryGrid.innerHTML = "";
      for (const slot of gallery.slots || []) {
        galleryGrid.appendChild(buildCard(slot, gallery));
      }
    }

    async function pollGallery() {
      if (state.polling) {
        return;
      }
      state.polling = true;
      try {
        while (state.busy) {
          await new Promise((resolve) => setTimeout(resolve, POLL_INTERVAL_MS));
          try {
            const data = await apiGet("/app/gallery");
            applyGallery(data.gallery);
          } catch (err) {
            setStatus(`Refresh failed: ${err.message}`);
          }
        }
      } finally {
        state.polling = false;
      }
    }

    async function handleFormSubmit(event) {
      event.preventDefault();

      const prompt = promptInput.value.trim();
      const count = parseInt(countSelect.value, 10);
      const aspectRatio = ratioSelect.value;
      if (!prompt || !count || !aspectRatio) {
        setStatus("Please fill out all fields!");
        return;
      }

      generateBtn.disabled = true;
      try {
        const data = await apiPost("/app/generate", {
          prompt,
          count,
          aspect_ratio: aspectRatio,
        });
        setStatus("");
        applyGallery(data.gallery);
        pollGallery();
      } catch (err) {
        setStatus(err.message);
        generateBtn.disabled = state.busy;
      }
    }

    function applyTheme(isDark) {
      document.body.classList.toggle("dark-theme", isDark);
      themeToggle.innerHTML = isDark ? "&#9728;" : "&#9790;";
    }

    function toggleTheme() {
      const isDark = !document.body.classList.contains("dark-theme");
      localStorage.setItem("theme", isDark ? "dark" : "light");
      applyTheme(isDark);
    }

    async function init() {
      const savedTheme = localStorage.getItem("theme");
      const prefersDark = window.matchMedia("(prefers-color-scheme: dark)").matches;
      applyTheme(savedTheme === "dark" || (!savedTheme && prefersDark));

      try {
        const data = await apiGet("/app/init");
        applyGallery(data.gallery);
        pollGallery();
      } catch (err) {
        setStatus(`Startup failed: ${err.message}`);
      }
    }

    themeToggle.addEventListener("click", toggleTheme);
    promptForm.addEventListener("submit", handleFormSubmit);
    promptBtn.addEventListener("click", () => {
      if (EXAMPLE_PROMPTS.length === 0) {
        return;
      }
      promptInput.value = EXAMPLE_PROMPTS[Math.floor(Math.random() * EXAMPLE_PROMPTS.length)];
      promptInput.focus();
    });

    init();
  </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::{build_main_ui_html, ratio_label, UiOptions};

    fn options() -> UiOptions {
        UiOptions {
            max_images: 3,
            default_count: 2,
            aspect_ratios: vec!["1/1".to_string(), "16/9".to_string(), "9/16".to_string()],
            default_aspect_ratio: "16/9".to_string(),
            example_prompts: vec!["a cat </script><b>".to_string()],
        }
    }

    #[test]
    fn renders_configured_choices() {
        let html = build_main_ui_html(&options());
        assert!(html.contains(r#"<option value="2" selected>2 Images</option>"#));
        assert!(html.contains(r#"<option value="3">3 Images</option>"#));
        assert!(!html.contains(r#"value="4""#));
        assert!(html.contains(r#"<option value="16/9" selected>Landscape (16:9)</option>"#));
        assert!(!html.contains("{{"));
    }

    #[test]
    fn example_prompts_cannot_close_the_script() {
        let html = build_main_ui_html(&options());
        assert!(!html.contains("a cat </script>"));
        assert!(html.contains(r#"a cat <\/script>"#));
    }

    #[test]
    fn ratio_labels_name_the_shape() {
        assert_eq!(ratio_label("1/1"), "Square (1:1)");
        assert_eq!(ratio_label("9/16"), "Portrait (9:16)");
        assert_eq!(ratio_label("4/3"), "Landscape (4:3)");
    }
}
