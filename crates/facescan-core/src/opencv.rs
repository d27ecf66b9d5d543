//! OpenCV cascade interop.
//!
//! Reads the `opencv-cascade-classifier` XML layout written by
//! `opencv_traincascade` (the layout of OpenCV's shipped
//! `haarcascade_*.xml` files) into a [`HaarCascade`]. Only boosted
//! decision stumps over upright Haar features are supported.

use crate::cascade::{CascadeError, HaarCascade, Stage, WeakClassifier, WeightedRect, WindowSize};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File name of OpenCV's default frontal-face cascade.
pub const OPENCV_FRONTALFACE: &str = "haarcascade_frontalface_default.xml";

/// Where distribution packages of OpenCV install their cascades.
const OPENCV_DATA_DIRS: &[&str] = &[
    "/usr/share/opencv4/haarcascades",
    "/usr/share/opencv/haarcascades",
    "/usr/local/share/opencv4/haarcascades",
    "/usr/local/share/opencv/haarcascades",
];

/// Path of an installed OpenCV frontal-face cascade, if any.
pub fn system_frontalface() -> Option<PathBuf> {
    OPENCV_DATA_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(OPENCV_FRONTALFACE))
        .find(|path| path.is_file())
}

#[derive(Debug, Deserialize)]
struct Storage {
    cascade: Option<XmlCascade>,
}

#[derive(Debug, Deserialize)]
struct XmlCascade {
    #[serde(rename = "stageType")]
    stage_type: String,
    #[serde(rename = "featureType")]
    feature_type: String,
    width: String,
    height: String,
    stages: Items<XmlStage>,
    features: Items<XmlFeature>,
}

/// OpenCV writes sequences as repeated `<_>` elements.
#[derive(Debug, Deserialize)]
struct Items<T> {
    #[serde(rename = "_", default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct XmlStage {
    #[serde(rename = "stageThreshold")]
    threshold: String,
    #[serde(rename = "weakClassifiers")]
    weak: Items<XmlWeak>,
}

#[derive(Debug, Deserialize)]
struct XmlWeak {
    #[serde(rename = "internalNodes")]
    internal_nodes: String,
    #[serde(rename = "leafValues")]
    leaf_values: String,
}

#[derive(Debug, Deserialize)]
struct XmlFeature {
    rects: Items<String>,
    #[serde(default)]
    tilted: Option<String>,
}

/// Convert an OpenCV cascade document. The result is not yet validated.
pub(crate) fn parse(raw: &str, name: &str) -> Result<HaarCascade, CascadeError> {
    let storage: Storage = quick_xml::de::from_str(raw)?;
    let xml = storage.cascade.ok_or_else(|| {
        CascadeError::Invalid("no <cascade> element; legacy haar-classifier files are not supported".into())
    })?;

    if xml.stage_type.trim() != "BOOST" || xml.feature_type.trim() != "HAAR" {
        return Err(CascadeError::Invalid(format!(
            "unsupported cascade type {}/{}, expected BOOST/HAAR",
            xml.stage_type.trim(),
            xml.feature_type.trim()
        )));
    }

    let window = WindowSize {
        width: number(&xml.width, "window width")?,
        height: number(&xml.height, "window height")?,
    };

    let features = xml
        .features
        .items
        .iter()
        .enumerate()
        .map(|(i, f)| feature(i, f))
        .collect::<Result<Vec<_>, _>>()?;

    let stages = xml
        .stages
        .items
        .iter()
        .enumerate()
        .map(|(s, stage)| -> Result<Stage, CascadeError> {
            let classifiers = stage
                .weak
                .items
                .iter()
                .enumerate()
                .map(|(c, weak)| stump(s, c, weak, &features))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Stage {
                threshold: number(&stage.threshold, "stage threshold")?,
                classifiers,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    tracing::debug!(
        name,
        stages = stages.len(),
        features = features.len(),
        "converted OpenCV cascade"
    );

    Ok(HaarCascade {
        name: name.to_string(),
        window,
        stages,
    })
}

fn feature(index: usize, xml: &XmlFeature) -> Result<Vec<WeightedRect>, CascadeError> {
    if xml.tilted.as_deref().is_some_and(|t| t.trim() != "0") {
        return Err(CascadeError::Invalid(format!(
            "feature {index} is tilted; only upright features are supported"
        )));
    }
    xml.rects
        .items
        .iter()
        .map(|rect| {
            let fields: Vec<&str> = rect.split_whitespace().collect();
            let [x, y, width, height, weight] = fields.as_slice() else {
                return Err(CascadeError::Invalid(format!(
                    "feature {index}: rect {rect:?} needs 5 fields"
                )));
            };
            Ok(WeightedRect {
                x: number(x, "rect x")?,
                y: number(y, "rect y")?,
                width: number(width, "rect width")?,
                height: number(height, "rect height")?,
                weight: number(weight, "rect weight")?,
            })
        })
        .collect()
}

/// A stump is written as internal nodes `0 -1 <feature> <threshold>` and
/// leaves `<below> <above>`.
fn stump(
    stage: usize,
    index: usize,
    xml: &XmlWeak,
    features: &[Vec<WeightedRect>],
) -> Result<WeakClassifier, CascadeError> {
    let nodes: Vec<&str> = xml.internal_nodes.split_whitespace().collect();
    let leaves: Vec<&str> = xml.leaf_values.split_whitespace().collect();

    let ([left, right, feature, threshold], [below, above]) = (nodes.as_slice(), leaves.as_slice()) else {
        return Err(CascadeError::Invalid(format!(
            "stage {stage} classifier {index}: only single-split stumps are supported"
        )));
    };
    if number::<i64>(left, "node left")? != 0 || number::<i64>(right, "node right")? != -1 {
        return Err(CascadeError::Invalid(format!(
            "stage {stage} classifier {index}: only single-split stumps are supported"
        )));
    }

    let feature_index: usize = number(feature, "feature index")?;
    let rects = features.get(feature_index).cloned().ok_or_else(|| {
        CascadeError::Invalid(format!(
            "stage {stage} classifier {index}: feature {feature_index} does not exist"
        ))
    })?;

    Ok(WeakClassifier {
        feature: rects,
        threshold: number(threshold, "node threshold")?,
        left: number(below, "leaf value")?,
        right: number(above, "leaf value")?,
    })
}

fn number<T: FromStr>(raw: &str, what: &str) -> Result<T, CascadeError> {
    raw.trim()
        .parse()
        .map_err(|_| CascadeError::Invalid(format!("{what}: cannot parse {:?}", raw.trim())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn document(features: &str, weak: &str) -> String {
        format!(
            r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>24</height>
  <width>24</width>
  <stageParams>
    <maxWeakCount>2</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>2</maxWeakCount>
      <stageThreshold>-1.2500000000000000e+00</stageThreshold>
      <weakClassifiers>
        {weak}</weakClassifiers></_></stages>
  <features>
    {features}</features></cascade>
</opencv_storage>
"#
        )
    }

    const FEATURES: &str = r#"<_>
      <rects>
        <_>
          6 4 12 9 -1.</_>
        <_>
          6 7 12 3 3.</_></rects></_>
    <_>
      <rects>
        <_>
          3 6 18 5 -1.</_>
        <_>
          9 6 6 5 3.</_></rects></_>"#;

    const WEAK: &str = r#"<_>
          <internalNodes>
            0 -1 0 -3.1511999666690826e-02</internalNodes>
          <leafValues>
            2.0875380039215088e+00 -2.2172100543975830e+00</leafValues></_>
        <!-- second stump -->
        <_>
          <internalNodes>
            0 -1 1 1.2396000325679779e-02</internalNodes>
          <leafValues>
            -1.8633940219879150e+00 1.3272049427032471e+00</leafValues></_>"#;

    #[test]
    fn test_parse_opencv_layout() {
        let cascade = HaarCascade::from_opencv_xml(&document(FEATURES, WEAK), "tiny").unwrap();
        assert_eq!(cascade.name, "tiny");
        assert_eq!(cascade.window.width, 24);
        assert_eq!(cascade.stages.len(), 1);

        let stage = &cascade.stages[0];
        assert_eq!(stage.threshold, -1.25);
        assert_eq!(stage.classifiers.len(), 2);

        let first = &stage.classifiers[0];
        assert_eq!(first.threshold, -3.1511999666690826e-02);
        assert_eq!(first.left, 2.0875380039215088);
        assert_eq!(first.right, -2.2172100543975830);
        assert_eq!(first.feature.len(), 2);
        assert_eq!(
            (first.feature[0].x, first.feature[0].y, first.feature[0].width, first.feature[0].height),
            (6, 4, 12, 9)
        );
        assert_eq!(first.feature[0].weight, -1.0);
        assert_eq!(first.feature[1].weight, 3.0);

        // Second stump points at the second feature.
        assert_eq!(stage.classifiers[1].feature[0].x, 3);
    }

    #[test]
    fn test_rejects_tilted_feature() {
        let tilted = FEATURES.replacen("</rects></_>", "</rects>\n      <tilted>1</tilted></_>", 1);
        let err = HaarCascade::from_opencv_xml(&document(&tilted, WEAK), "tilted").unwrap_err();
        assert!(matches!(err, CascadeError::Invalid(msg) if msg.contains("tilted")));
    }

    #[test]
    fn test_rejects_deeper_trees() {
        let tree = WEAK.replacen(
            "0 -1 0 -3.1511999666690826e-02",
            "1 -1 0 -3.15e-02 0 -2 1 1.0e-02",
            1,
        );
        let err = HaarCascade::from_opencv_xml(&document(FEATURES, &tree), "tree").unwrap_err();
        assert!(matches!(err, CascadeError::Invalid(msg) if msg.contains("stumps")));
    }

    #[test]
    fn test_rejects_unknown_feature_index() {
        let dangling = WEAK.replacen("0 -1 1 1.2396", "0 -1 7 1.2396", 1);
        let err = HaarCascade::from_opencv_xml(&document(FEATURES, &dangling), "dangling").unwrap_err();
        assert!(matches!(err, CascadeError::Invalid(msg) if msg.contains("feature 7")));
    }

    #[test]
    fn test_rejects_legacy_layout() {
        let legacy = r#"<?xml version="1.0"?>
<opencv_storage>
<haarcascade_frontalface_alt type_id="opencv-haar-classifier">
  <size>20 20</size>
  <stages></stages>
</haarcascade_frontalface_alt>
</opencv_storage>"#;
        let err = HaarCascade::from_opencv_xml(legacy, "legacy").unwrap_err();
        assert!(matches!(err, CascadeError::Invalid(msg) if msg.contains("legacy")));
    }

    #[test]
    fn test_rejects_lbp_cascade() {
        let lbp = document(FEATURES, WEAK).replace("<featureType>HAAR</featureType>", "<featureType>LBP</featureType>");
        let err = HaarCascade::from_opencv_xml(&lbp, "lbp").unwrap_err();
        assert!(matches!(err, CascadeError::Invalid(msg) if msg.contains("LBP")));
    }

    #[test]
    fn test_from_path_dispatches_on_xml_extension() {
        let mut file = tempfile::Builder::new().suffix(".xml").tempfile().unwrap();
        file.write_all(document(FEATURES, WEAK).as_bytes()).unwrap();

        let cascade = HaarCascade::from_path(file.path()).unwrap();
        assert_eq!(cascade.stages[0].classifiers.len(), 2);
        let stem = file.path().file_stem().unwrap().to_string_lossy().into_owned();
        assert_eq!(cascade.name, stem);
    }
}
