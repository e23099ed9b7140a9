use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::imageops::FilterType;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::configuration::ModelSettings;

/// The four labels the classifier was trained on, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TumorClass {
    #[serde(rename = "glioma")]
    Glioma,
    #[serde(rename = "meningioma")]
    Meningioma,
    #[serde(rename = "notumor")]
    NoTumor,
    #[serde(rename = "pituitary")]
    Pituitary,
}

impl TumorClass {
    pub const ALL: [TumorClass; 4] = [
        TumorClass::Glioma,
        TumorClass::Meningioma,
        TumorClass::NoTumor,
        TumorClass::Pituitary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TumorClass::Glioma => "glioma",
            TumorClass::Meningioma => "meningioma",
            TumorClass::NoTumor => "notumor",
            TumorClass::Pituitary => "pituitary",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            TumorClass::Glioma => 0,
            TumorClass::Meningioma => 1,
            TumorClass::NoTumor => 2,
            TumorClass::Pituitary => 3,
        }
    }

    pub fn is_tumor(&self) -> bool {
        *self != TumorClass::NoTumor
    }
}

impl fmt::Display for TumorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TumorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TumorClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("{} is not a known tumor class", s))
    }
}

/// Per-class probabilities, always keyed by the full label set in label order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probabilities([f32; 4]);

impl Probabilities {
    pub fn new(values: [f32; 4]) -> Self {
        Self(values)
    }

    pub fn get(&self, class: TumorClass) -> f32 {
        self.0[class.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (TumorClass, f32)> + '_ {
        TumorClass::ALL.into_iter().zip(self.0.iter().copied())
    }

    pub fn sum(&self) -> f32 {
        self.0.iter().sum()
    }
}

impl Serialize for Probabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (class, probability) in self.iter() {
            map.serialize_entry(class.as_str(), &probability)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub predicted_class: TumorClass,
    pub probabilities: Probabilities,
}

impl Prediction {
    /// Builds a prediction from raw classifier output. Ties go to the first label.
    pub fn from_scores(scores: &[f32]) -> Result<Self, PredictError> {
        let values: [f32; 4] = scores.try_into().map_err(|_| {
            PredictError::Inference(format!(
                "expected {} class scores, model returned {}",
                TumorClass::ALL.len(),
                scores.len()
            ))
        })?;

        if values.iter().any(|value| !value.is_finite()) {
            return Err(PredictError::Inference(
                "model returned a non-finite score".to_string(),
            ));
        }

        let mut best = 0;
        for (i, value) in values.iter().enumerate() {
            if *value > values[best] {
                best = i;
            }
        }

        Ok(Prediction {
            predicted_class: TumorClass::ALL[best],
            probabilities: Probabilities(values),
        })
    }
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("unable to load model: {0}")]
    Load(String),
    #[error("image path does not exist: {}", .0.display())]
    NotFound(PathBuf),
    #[error("invalid image file {}: {source}", .path.display())]
    InvalidImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("prediction failed: {0}")]
    Inference(String),
}

/// A single preprocessed image laid out as `[1, size, size, 3]`, values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    size: u32,
    data: Vec<f32>,
}

impl ImageBatch {
    pub fn shape(&self) -> [u64; 4] {
        [1, self.size as u64, self.size as u64, 3]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Anything that turns an image batch into one score per class.
pub trait Classifier: Send + Sync {
    fn classify(&self, batch: &ImageBatch) -> anyhow::Result<Vec<f32>>;
}

pub struct Predictor {
    classifier: Box<dyn Classifier>,
    input_size: u32,
}

impl Predictor {
    pub fn new(classifier: Box<dyn Classifier>, input_size: u32) -> Self {
        Self {
            classifier,
            input_size,
        }
    }

    #[cfg(feature = "tensorflow")]
    pub fn from_settings(settings: &ModelSettings) -> Result<Self, PredictError> {
        let classifier = TensorflowClassifier::load(
            &settings.path,
            &settings.input_operation,
            &settings.output_operation,
        )
        .map_err(|e| {
            tracing::error!("Failed to load model: {:?}", e);
            PredictError::Load(format!("{}: {}", settings.path.display(), e))
        })?;
        tracing::info!(path = %settings.path.display(), "Model loaded successfully");

        Ok(Self::new(Box::new(classifier), settings.input_size))
    }

    #[cfg(not(feature = "tensorflow"))]
    pub fn from_settings(settings: &ModelSettings) -> Result<Self, PredictError> {
        Err(PredictError::Load(format!(
            "{}: built without the `tensorflow` feature",
            settings.path.display()
        )))
    }

    pub fn preprocess_image(&self, path: &Path) -> Result<ImageBatch, PredictError> {
        let invalid = |source: image::ImageError| PredictError::InvalidImage {
            path: path.to_path_buf(),
            source,
        };

        // sniff the format from content, uploads keep whatever extension the client sent
        let img = image::io::Reader::open(path)
            .and_then(|reader| reader.with_guessed_format())
            .map_err(|e| invalid(image::ImageError::IoError(e)))?
            .decode()
            .map_err(invalid)?;

        let rgb = img.to_rgb8();
        let resized =
            image::imageops::resize(&rgb, self.input_size, self.input_size, FilterType::Triangle);

        let mut flat_img =
            Vec::with_capacity((self.input_size * self.input_size * 3) as usize);

        for pixel in resized.pixels() {
            flat_img.push(pixel[0] as f32 / 255.0);
            flat_img.push(pixel[1] as f32 / 255.0);
            flat_img.push(pixel[2] as f32 / 255.0);
        }

        Ok(ImageBatch {
            size: self.input_size,
            data: flat_img,
        })
    }

    #[tracing::instrument(name = "Predictor: predict", skip(self, path), fields(path = %path.display()))]
    pub fn predict(&self, path: &Path) -> Result<Prediction, PredictError> {
        if !path.exists() {
            tracing::error!("Image path does not exist");
            return Err(PredictError::NotFound(path.to_path_buf()));
        }

        let batch = self.preprocess_image(path).map_err(|e| {
            tracing::error!("Error preprocessing image: {}", e);
            e
        })?;

        let scores = self.classifier.classify(&batch).map_err(|e| {
            tracing::error!("Prediction failed: {:?}", e);
            PredictError::Inference(e.to_string())
        })?;

        let prediction = Prediction::from_scores(&scores).map_err(|e| {
            tracing::error!("Prediction failed: {}", e);
            e
        })?;

        tracing::info!(predicted_class = %prediction.predicted_class, "Prediction complete");
        Ok(prediction)
    }
}

#[cfg(feature = "tensorflow")]
pub use self::tf::TensorflowClassifier;

#[cfg(feature = "tensorflow")]
mod tf {
    use std::fs::File;
    use std::io::Read;
    use std::path::Path;
    use std::sync::Mutex;

    use tensorflow::{
        Graph, ImportGraphDefOptions, Operation, Session, SessionOptions, SessionRunArgs, Tensor,
    };

    use super::{Classifier, ImageBatch};

    struct Loaded {
        session: Session,
        // keeps the graph alive for as long as the operations below
        _graph: Graph,
        input: Operation,
        output: Operation,
    }

    /// Frozen graph classifier. The session lock serializes inference.
    pub struct TensorflowClassifier {
        loaded: Mutex<Loaded>,
    }

    impl TensorflowClassifier {
        pub fn load(
            model_path: &Path,
            input_name: &str,
            output_name: &str,
        ) -> Result<Self, Box<dyn std::error::Error>> {
            let mut graph = Graph::new();
            let mut model_file = File::open(model_path)?;
            let mut model_bytes = Vec::new();
            model_file.read_to_end(&mut model_bytes)?;

            graph.import_graph_def(&model_bytes, &ImportGraphDefOptions::new())?;

            let session = Session::new(&SessionOptions::new(), &graph)?;

            let input = graph
                .operation_by_name(input_name)
                .map_err(|_| "Failed to retrieve input operation")?
                .ok_or_else(|| format!("Input operation '{}' not found in graph", input_name))?;

            let output = graph
                .operation_by_name(output_name)
                .map_err(|_| "Failed to retrieve output operation")?
                .ok_or_else(|| format!("Output operation '{}' not found in graph", output_name))?;

            Ok(Self {
                loaded: Mutex::new(Loaded {
                    session,
                    _graph: graph,
                    input,
                    output,
                }),
            })
        }
    }

    impl Classifier for TensorflowClassifier {
        fn classify(&self, batch: &ImageBatch) -> anyhow::Result<Vec<f32>> {
            let mut tensor = Tensor::new(&batch.shape());
            tensor.copy_from_slice(batch.as_slice());

            let loaded = self
                .loaded
                .lock()
                .map_err(|_| anyhow::anyhow!("inference lock poisoned"))?;

            let mut args = SessionRunArgs::new();
            args.add_feed(&loaded.input, 0, &tensor);
            let output_token = args.request_fetch(&loaded.output, 0);
            loaded.session.run(&mut args)?;
            let output_tensor: Tensor<f32> = args.fetch(output_token)?;

            Ok(output_tensor.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{write_image, StubClassifier};

    fn predictor() -> Predictor {
        Predictor::new(Box::new(StubClassifier::default()), 32)
    }

    #[test]
    fn from_scores_picks_the_largest_label() {
        let prediction = Prediction::from_scores(&[0.1, 0.2, 0.6, 0.1]).unwrap();
        assert_eq!(prediction.predicted_class, TumorClass::NoTumor);
        assert_eq!(prediction.probabilities.get(TumorClass::Meningioma), 0.2);
    }

    #[test]
    fn from_scores_breaks_ties_towards_the_first_label() {
        let prediction = Prediction::from_scores(&[0.4, 0.4, 0.1, 0.1]).unwrap();
        assert_eq!(prediction.predicted_class, TumorClass::Glioma);
    }

    #[test]
    fn from_scores_rejects_wrong_arity() {
        let err = Prediction::from_scores(&[0.5, 0.5]).unwrap_err();
        assert!(matches!(err, PredictError::Inference(_)));
    }

    #[test]
    fn from_scores_rejects_nan() {
        let err = Prediction::from_scores(&[f32::NAN, 0.5, 0.25, 0.25]).unwrap_err();
        assert!(matches!(err, PredictError::Inference(_)));
    }

    #[test]
    fn probabilities_serialize_in_label_order() {
        let prediction = Prediction::from_scores(&[0.7, 0.1, 0.1, 0.1]).unwrap();
        let json = serde_json::to_string(&prediction).unwrap();
        let glioma = json.find("glioma").unwrap();
        let meningioma = json.find("meningioma").unwrap();
        let notumor = json.find("notumor").unwrap();
        let pituitary = json.find("pituitary").unwrap();
        assert!(glioma < meningioma && meningioma < notumor && notumor < pituitary);
        assert!(json.starts_with(r#"{"predicted_class":"glioma""#));
    }

    #[test]
    fn tumor_class_parses_its_own_labels() {
        for class in TumorClass::ALL {
            assert_eq!(class.as_str().parse::<TumorClass>().unwrap(), class);
        }
        assert!("astrocytoma".parse::<TumorClass>().is_err());
        assert!(!TumorClass::NoTumor.is_tumor());
        assert!(TumorClass::Pituitary.is_tumor());
    }

    #[test]
    fn preprocess_produces_a_normalized_square_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        write_image(&path, 64, 40, [255, 128, 0]);

        let batch = predictor().preprocess_image(&path).unwrap();
        assert_eq!(batch.shape(), [1, 32, 32, 3]);
        assert_eq!(batch.as_slice().len(), 32 * 32 * 3);
        assert!(batch.as_slice().iter().all(|v| (0.0..=1.0).contains(v)));
        assert!((batch.as_slice()[0] - 1.0).abs() < 5e-3);
        assert!(batch.as_slice()[2].abs() < 5e-3);
    }

    #[test]
    fn preprocess_converts_grayscale_to_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        image::GrayImage::from_pixel(10, 10, image::Luma([51]))
            .save(&path)
            .unwrap();

        let batch = predictor().preprocess_image(&path).unwrap();
        assert_eq!(batch.shape(), [1, 32, 32, 3]);
        assert!(batch.as_slice().iter().all(|v| (v - 0.2).abs() < 5e-3));
    }

    #[test]
    fn predict_returns_all_four_probabilities() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.jpg");
        write_image(&path, 50, 50, [10, 10, 10]);

        let prediction = predictor().predict(&path).unwrap();
        assert_eq!(prediction.probabilities.iter().count(), 4);
        assert!((prediction.probabilities.sum() - 1.0).abs() < 1e-3);
        let max = prediction
            .probabilities
            .iter()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap();
        assert_eq!(max.0, prediction.predicted_class);
    }

    #[test]
    fn predict_reports_missing_files() {
        let err = predictor()
            .predict(Path::new("/definitely/not/here.png"))
            .unwrap_err();
        assert!(matches!(err, PredictError::NotFound(_)));
    }

    #[test]
    fn predict_reports_undecodable_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not really a png").unwrap();

        let err = predictor().predict(&path).unwrap_err();
        assert!(matches!(err, PredictError::InvalidImage { .. }));
    }

    #[test]
    fn predict_surfaces_classifier_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        write_image(&path, 8, 8, [0, 0, 0]);

        let predictor = Predictor::new(Box::new(StubClassifier::failing()), 16);
        let err = predictor.predict(&path).unwrap_err();
        assert!(matches!(err, PredictError::Inference(_)));
    }
}
