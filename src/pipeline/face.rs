use anyhow::{Context, Result};
use image::DynamicImage;
use ort::session::Session;
use ort::value::Value;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use crate::pipeline::extractor::{DescriptorExtractor, ExtractError, FaceDescriptor, FaceRegion};

const SCRFD_MODEL_URL_HF: &str = "https://huggingface.co/ykk648/face_lib/resolve/main/face_detect/scrfd_onnx/scrfd_500m_bnkps.onnx";
const SCRFD_MODEL_URL_GH: &str = "https://github.com/deepinsight/insightface/releases/download/v0.7/scrfd_500m_bnkps.onnx";
const ARCFACE_MODEL_URL: &str = "https://huggingface.co/maze/faceX/resolve/e010b5098c3685fd00b22dd2aec6f37320e3d850/w600k_r50.onnx";

const SCRFD_FILE: &str = "scrfd_500m_bnkps.onnx";
const ARCFACE_FILE: &str = "w600k_r50.onnx";

const DETECT_SIZE: u32 = 640;
const EMBED_SIZE: u32 = 112;
const STRIDES: [u32; 3] = [8, 16, 32];
const MIN_FACE_PX: f32 = 8.0;

pub const DEFAULT_DETECT_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_NMS_IOU: f32 = 0.4;

type Tensor = ([i64; 4], Vec<f32>);

/// SCRFD detection plus ArcFace embedding over ONNX Runtime.
pub struct FaceProcessor {
    pub models_dir: PathBuf,
    detect_confidence: f32,
    nms_iou: f32,
    scrfd_session: Option<Mutex<Session>>,
    arcface_session: Option<Mutex<Session>>,
}

impl FaceProcessor {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            detect_confidence: std::env::var("FACEFIND_DETECT_CONFIDENCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DETECT_CONFIDENCE),
            nms_iou: DEFAULT_NMS_IOU,
            scrfd_session: None,
            arcface_session: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.scrfd_session.is_some() && self.arcface_session.is_some()
    }

    /// Downloads missing models (unless disabled) and loads both sessions.
    pub async fn initialize(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.models_dir).context("Failed to create models directory")?;

        let auto_dl = std::env::var("FACEFIND_MODEL_AUTO_DOWNLOAD")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE"))
            .unwrap_or(true);
        if auto_dl {
            if let Err(e) = self.download_models().await {
                warn!("Face model download failed: {}", e);
            }
        } else {
            info!("Face model auto-download disabled");
        }

        self.load_models()
    }

    async fn download_models(&self) -> Result<()> {
        let scrfd_path = self.models_dir.join(SCRFD_FILE);
        let arcface_path = self.models_dir.join(ARCFACE_FILE);
        let client = create_http_client()?;

        if !scrfd_path.exists() {
            info!("Downloading SCRFD detection model...");
            if let Err(e) = download_file(&client, SCRFD_MODEL_URL_HF, &scrfd_path).await {
                warn!("Hugging Face download failed: {}. Trying GitHub...", e);
                download_file(&client, SCRFD_MODEL_URL_GH, &scrfd_path).await?;
            }
        }
        if !arcface_path.exists() {
            info!("Downloading ArcFace recognition model...");
            download_file(&client, ARCFACE_MODEL_URL, &arcface_path).await?;
        }
        Ok(())
    }

    fn load_models(&mut self) -> Result<()> {
        let scrfd_path = self.models_dir.join(SCRFD_FILE);
        let arcface_path = self.models_dir.join(ARCFACE_FILE);
        if !scrfd_path.exists() || !arcface_path.exists() {
            anyhow::bail!("Face models missing; expected {:?} and {:?}", scrfd_path, arcface_path);
        }

        let scrfd = Session::builder()?
            .commit_from_file(&scrfd_path)
            .context("Failed to create SCRFD session")?;
        let arcface = Session::builder()?
            .commit_from_file(&arcface_path)
            .context("Failed to create ArcFace session")?;

        self.scrfd_session = Some(Mutex::new(scrfd));
        self.arcface_session = Some(Mutex::new(arcface));
        info!("Face models loaded from {:?}", self.models_dir);
        Ok(())
    }

    /// Letterboxes to 640x640 and returns the NCHW BGR tensor plus the scale used.
    fn preprocess_scrfd(&self, image: &DynamicImage) -> (Tensor, f32) {
        let (ow, oh) = (image.width() as f32, image.height() as f32);
        let scale = DETECT_SIZE as f32 / ow.max(oh);
        let nw = ((ow * scale) as u32).max(1);
        let nh = ((oh * scale) as u32).max(1);
        let resized = image.resize_exact(nw, nh, image::imageops::FilterType::Triangle);
        let mut padded = DynamicImage::new_rgb8(DETECT_SIZE, DETECT_SIZE);
        image::imageops::overlay(&mut padded, &resized, 0, 0);
        let rgb = padded.to_rgb8();

        let side = DETECT_SIZE as i64;
        let mut data = Vec::with_capacity((3 * side * side) as usize);
        for c in [2usize, 1, 0] {
            for y in 0..DETECT_SIZE {
                for x in 0..DETECT_SIZE {
                    let v = rgb.get_pixel(x, y)[c] as f32;
                    data.push((v - 127.5) / 128.0);
                }
            }
        }
        (([1, 3, side, side], data), scale)
    }

    fn preprocess_arcface(&self, face_crop: &DynamicImage) -> Tensor {
        let resized = face_crop.resize_exact(EMBED_SIZE, EMBED_SIZE, image::imageops::FilterType::Triangle);
        let rgb = resized.to_rgb8();
        let side = EMBED_SIZE as i64;
        let mut data = Vec::with_capacity((3 * side * side) as usize);
        for c in 0..3 {
            for y in 0..EMBED_SIZE {
                for x in 0..EMBED_SIZE {
                    let v = rgb.get_pixel(x, y)[c] as f32;
                    data.push((v - 127.5) / 128.0);
                }
            }
        }
        ([1, 3, side, side], data)
    }

    pub fn detect_faces(&self, image: &DynamicImage) -> Result<Vec<FaceRegion>> {
        let mut session = self
            .scrfd_session
            .as_ref()
            .context("Detection model not loaded")?
            .lock();
        let ((shape, data), scale) = self.preprocess_scrfd(image);
        let img_w = image.width() as f32;
        let img_h = image.height() as f32;

        let input_name = session.inputs[0].name.clone();
        let input = Value::from_array((shape.to_vec(), data)).context("Failed to create SCRFD input tensor")?;
        let outputs = session
            .run(ort::inputs![input_name => input])
            .context("SCRFD inference failed")?;

        let mut raw: Vec<FaceRegion> = Vec::new();
        for stride in STRIDES {
            let (Some(sv), Some(bv)) = (outputs.get(&format!("score_{}", stride)), outputs.get(&format!("bbox_{}", stride))) else {
                debug!("SCRFD output for stride {} missing", stride);
                continue;
            };
            let (Ok((_, scores)), Ok((_, boxes))) = (sv.try_extract_tensor::<f32>(), bv.try_extract_tensor::<f32>()) else {
                continue;
            };
            raw.extend(decode_stride(scores, boxes, stride as f32, scale, img_w, img_h, self.detect_confidence));
        }

        let keep = nms(&raw, self.nms_iou);
        let out: Vec<FaceRegion> = keep.into_iter().map(|i| raw[i]).collect();
        debug!("SCRFD: {} candidates, {} after NMS", raw.len(), out.len());
        Ok(out)
    }

    /// L2-normalized ArcFace embedding of a face crop. Empty if the model
    /// produced nothing usable.
    pub fn recognize_face(&self, face_crop: &DynamicImage) -> Result<Vec<f32>> {
        let mut session = self
            .arcface_session
            .as_ref()
            .context("Recognition model not loaded")?
            .lock();
        let (shape, data) = self.preprocess_arcface(face_crop);

        let input_name = session.inputs[0].name.clone();
        let input = Value::from_array((shape.to_vec(), data)).context("Failed to create ArcFace input tensor")?;
        let outputs = session
            .run(ort::inputs![input_name => input])
            .context("ArcFace inference failed")?;

        let key = outputs
            .keys()
            .find(|k| matches!(*k, "output" | "embedding" | "fc1" | "features"))
            .or_else(|| outputs.keys().next())
            .map(|k| k.to_string());
        let Some(key) = key else {
            error!("ArcFace model produced no outputs");
            return Ok(vec![]);
        };
        let Some(val) = outputs.get(&key) else {
            return Ok(vec![]);
        };
        let (_, slice) = val.try_extract_tensor::<f32>().context("Failed to read ArcFace output")?;
        Ok(l2_normalize(slice.to_vec()))
    }

    pub fn process_image(&self, image: &DynamicImage) -> Result<Vec<FaceDescriptor>> {
        let regions = self.detect_faces(image)?;
        let mut out = Vec::with_capacity(regions.len());
        for region in regions {
            let x = region.x1.max(0.0) as u32;
            let y = region.y1.max(0.0) as u32;
            let w = ((region.x2 - region.x1) as u32).max(1);
            let h = ((region.y2 - region.y1) as u32).max(1);
            let crop = image.crop_imm(x, y, w, h);
            let vector = self.recognize_face(&crop)?;
            if vector.is_empty() {
                warn!("Skipping face without embedding at ({:.0},{:.0})", region.x1, region.y1);
                continue;
            }
            out.push(FaceDescriptor { region, vector });
        }
        Ok(out)
    }
}

fn create_http_client() -> Result<reqwest::Client> {
    let mut headers = reqwest::header::HeaderMap::new();
    if let Ok(token) = std::env::var("HF_TOKEN") {
        if !token.is_empty() {
            info!("Using Hugging Face token for model download");
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .context("Failed to create HTTP client")
}

async fn download_file(client: &reqwest::Client, url: &str, path: &Path) -> Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Failed to download model from {}", url))?;
    if !response.status().is_success() {
        anyhow::bail!("Failed to download model: HTTP {}", response.status());
    }
    let bytes = response.bytes().await.context("Failed to read response body")?;
    // ONNX files are never this small; an HTML error page usually is.
    if bytes.len() < 1024 {
        anyhow::bail!("Downloaded file is suspiciously small ({} bytes)", bytes.len());
    }
    std::fs::write(path, &bytes).with_context(|| format!("Failed to write file: {:?}", path))?;
    info!("Downloaded model to {:?} ({} bytes)", path, bytes.len());
    Ok(())
}

/// Decodes one SCRFD stride: each grid point carries one or more anchors with a
/// score and `(l, t, r, b)` distances in stride units. Boxes come back in
/// original image coordinates.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: f32,
    scale: f32,
    img_w: f32,
    img_h: f32,
    threshold: f32,
) -> Vec<FaceRegion> {
    let side = (DETECT_SIZE as f32 / stride) as usize;
    let grid = side * side;
    if grid == 0 || scores.len() % grid != 0 || boxes.len() < scores.len() * 4 {
        warn!("SCRFD stride {}: unexpected output sizes ({} scores, {} boxes)", stride, scores.len(), boxes.len());
        return vec![];
    }
    let anchors = scores.len() / grid;

    let mut out = Vec::new();
    for i in 0..grid {
        let cy = (i / side) as f32 * stride;
        let cx = (i % side) as f32 * stride;
        for a in 0..anchors {
            let idx = i * anchors + a;
            let confidence = scores[idx];
            if confidence < threshold {
                continue;
            }
            let b = idx * 4;
            let x1 = ((cx - boxes[b] * stride) / scale).clamp(0.0, img_w);
            let y1 = ((cy - boxes[b + 1] * stride) / scale).clamp(0.0, img_h);
            let x2 = ((cx + boxes[b + 2] * stride) / scale).clamp(0.0, img_w);
            let y2 = ((cy + boxes[b + 3] * stride) / scale).clamp(0.0, img_h);
            if x2 - x1 < MIN_FACE_PX || y2 - y1 < MIN_FACE_PX {
                continue;
            }
            out.push(FaceRegion { x1, y1, x2, y2, confidence });
        }
    }
    out
}

fn nms(boxes: &[FaceRegion], iou_threshold: f32) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..boxes.len()).collect();
    indices.sort_by(|&a, &b| {
        boxes[b]
            .confidence
            .partial_cmp(&boxes[a].confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut keep = Vec::new();
    let mut suppressed = vec![false; boxes.len()];
    for (i, &ia) in indices.iter().enumerate() {
        if suppressed[ia] {
            continue;
        }
        keep.push(ia);
        for &ib in indices.iter().skip(i + 1) {
            if !suppressed[ib] && iou(&boxes[ia], &boxes[ib]) > iou_threshold {
                suppressed[ib] = true;
            }
        }
    }
    keep
}

fn iou(a: &FaceRegion, b: &FaceRegion) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);
    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }
    let intersection = (x2 - x1) * (y2 - y1);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vec![];
    }
    for x in &mut v {
        *x /= norm;
    }
    v
}

/// `DescriptorExtractor` over a shared `FaceProcessor` that may still be loading.
#[derive(Clone)]
pub struct OnnxExtractor {
    processor: Arc<RwLock<FaceProcessor>>,
}

impl OnnxExtractor {
    pub fn new(models_dir: PathBuf) -> Self {
        Self { processor: Arc::new(RwLock::new(FaceProcessor::new(models_dir))) }
    }

    /// Loads the models on the runtime and swaps the loaded processor in.
    /// The extractor reports not-ready until then.
    pub fn spawn_initialize(&self) -> tokio::task::JoinHandle<()> {
        let shared = self.processor.clone();
        let models_dir = shared.read().models_dir.clone();
        tokio::spawn(async move {
            let mut loaded = FaceProcessor::new(models_dir);
            match loaded.initialize().await {
                Ok(()) => {
                    *shared.write() = loaded;
                    info!("Face extractor ready");
                }
                Err(e) => error!("Failed to initialize face models: {:#}", e),
            }
        })
    }
}

impl DescriptorExtractor for OnnxExtractor {
    fn is_ready(&self) -> bool {
        self.processor.read().is_loaded()
    }

    fn extract(&self, image_bytes: &[u8]) -> Result<Vec<FaceDescriptor>, ExtractError> {
        let processor = self.processor.read();
        if !processor.is_loaded() {
            return Err(ExtractError::NotReady);
        }
        let image = image::load_from_memory(image_bytes).map_err(|e| ExtractError::Decode(e.to_string()))?;
        processor
            .process_image(&image)
            .map_err(|e| ExtractError::Inference(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> FaceRegion {
        FaceRegion { x1, y1, x2, y2, confidence }
    }

    #[test]
    fn test_nms_keeps_best_of_overlapping() {
        let boxes = vec![
            region(0.0, 0.0, 100.0, 100.0, 0.6),
            region(5.0, 5.0, 105.0, 105.0, 0.9),
            region(300.0, 300.0, 350.0, 350.0, 0.7),
        ];
        let keep = nms(&boxes, DEFAULT_NMS_IOU);
        assert_eq!(keep, vec![1, 2]);
    }

    #[test]
    fn test_iou_disjoint_is_zero() {
        let a = region(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = region(20.0, 20.0, 30.0, 30.0, 1.0);
        assert_eq!(iou(&a, &b), 0.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_maps_back_to_image() {
        // stride 32 grid is 20x20, one anchor per point
        let grid = 20 * 20;
        let mut scores = vec![0.0f32; grid];
        let mut boxes = vec![0.0f32; grid * 4];
        // grid point (row 2, col 3) -> centre (96, 64) in 640 space
        let idx = 2 * 20 + 3;
        scores[idx] = 0.95;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let out = decode_stride(&scores, &boxes, 32.0, 0.5, 1280.0, 960.0, 0.5);
        assert_eq!(out.len(), 1);
        let f = out[0];
        assert!((f.x1 - 128.0).abs() < 1e-3);
        assert!((f.y1 - 64.0).abs() < 1e-3);
        assert!((f.x2 - 256.0).abs() < 1e-3);
        assert!((f.y2 - 192.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_stride_rejects_bad_shapes() {
        assert!(decode_stride(&[0.9; 7], &[1.0; 28], 32.0, 1.0, 640.0, 640.0, 0.5).is_empty());
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert!(l2_normalize(vec![0.0, 0.0]).is_empty());
    }

    #[test]
    fn test_extractor_not_ready_before_load() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = OnnxExtractor::new(dir.path().to_path_buf());
        assert!(!extractor.is_ready());
        assert!(matches!(extractor.extract(b"anything"), Err(ExtractError::NotReady)));
    }
}
