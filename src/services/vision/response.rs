// Shapes raw annotate responses into the per-operation result payloads

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Map, Value};

use crate::core::errors::{VisionError, VisionResult};
use crate::core::types::{
    DetectionParams, FaceDetectionParams, NaturalElementsParams, Operation, Params,
};

/// Label keywords grouped into natural-element categories
const NATURAL_CATEGORIES: &[(&str, &[&str])] = &[
    ("sky", &["sky", "cloud", "sunset", "sunrise"]),
    ("water", &["water", "sea", "ocean", "lake", "river", "waterfall"]),
    ("vegetation", &["tree", "plant", "grass", "forest", "flower", "leaf", "vegetation"]),
    ("terrain", &["mountain", "rock", "sand", "beach", "hill", "desert", "snow"]),
];

/// Annotate features requested for an operation: `(feature type, max results)`.
pub fn features_for(operation: Operation, params: &Params) -> Vec<(&'static str, u32)> {
    match operation {
        Operation::ObjectDetection => {
            let p: DetectionParams = typed_params(params);
            let mut features = vec![("OBJECT_LOCALIZATION", 50)];
            if p.include_faces {
                features.push(("FACE_DETECTION", 20));
            }
            if p.include_labels {
                features.push(("LABEL_DETECTION", 20));
            }
            features
        }
        Operation::NaturalElements => {
            let p: NaturalElementsParams = typed_params(params);
            let mut features = vec![("LABEL_DETECTION", 50)];
            if p.include_colors {
                features.push(("IMAGE_PROPERTIES", 10));
            }
            features
        }
        Operation::FaceDetection => vec![("FACE_DETECTION", 50)],
    }
}

/// Read a typed parameter struct out of a parameter map. Unknown keys are
/// ignored; a missing or malformed key takes its default without affecting
/// the other fields.
pub fn typed_params<T: Serialize + DeserializeOwned + Default>(params: &Params) -> T {
    let Ok(Value::Object(mut merged)) = serde_json::to_value(T::default()) else {
        return T::default();
    };
    for (key, value) in params {
        let Some(fallback) = merged.insert(key.clone(), value.clone()) else {
            merged.remove(key);
            continue;
        };
        if serde_json::from_value::<T>(Value::Object(merged.clone())).is_err() {
            merged.insert(key.clone(), fallback);
        }
    }
    serde_json::from_value(Value::Object(merged)).unwrap_or_default()
}

/// Convert one entry of `responses[]` into the operation's result payload.
pub fn shape_response(
    operation: Operation,
    params: &Params,
    index: usize,
    response: &Value,
) -> VisionResult<Value> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown image error")
            .to_string();
        return Err(VisionError::Image { index, message });
    }
    if !response.is_object() {
        return Err(VisionError::InvalidResponse(format!(
            "response {} is not an object",
            index
        )));
    }

    Ok(match operation {
        Operation::ObjectDetection => shape_detection(&typed_params(params), response),
        Operation::NaturalElements => shape_natural_elements(&typed_params(params), response),
        Operation::FaceDetection => shape_faces(&typed_params(params), response),
    })
}

fn annotations<'a>(response: &'a Value, field: &str) -> &'a [Value] {
    response
        .get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn score(annotation: &Value, field: &str) -> f64 {
    annotation.get(field).and_then(Value::as_f64).unwrap_or(0.0)
}

fn vertices(poly: Option<&Value>, field: &str) -> Value {
    let points = poly
        .and_then(|p| p.get(field))
        .and_then(Value::as_array)
        .map(|vs| {
            vs.iter()
                .map(|v| {
                    json!({
                        "x": v.get("x").cloned().unwrap_or(json!(0)),
                        "y": v.get("y").cloned().unwrap_or(json!(0)),
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Value::Array(points)
}

fn labels(response: &Value, threshold: f64) -> Vec<Value> {
    annotations(response, "labelAnnotations")
        .iter()
        .filter(|l| score(l, "score") >= threshold)
        .map(|l| {
            json!({
                "description": l.get("description").and_then(Value::as_str).unwrap_or_default(),
                "confidence": score(l, "score"),
            })
        })
        .collect()
}

fn faces(response: &Value, threshold: f64) -> Vec<Value> {
    annotations(response, "faceAnnotations")
        .iter()
        .filter(|f| score(f, "detectionConfidence") >= threshold)
        .map(|f| {
            let likelihood = |field: &str| {
                f.get(field)
                    .and_then(Value::as_str)
                    .unwrap_or("UNKNOWN")
                    .to_string()
            };
            json!({
                "confidence": score(f, "detectionConfidence"),
                "bounding_box": vertices(f.get("boundingPoly"), "vertices"),
                "joy": likelihood("joyLikelihood"),
                "sorrow": likelihood("sorrowLikelihood"),
                "anger": likelihood("angerLikelihood"),
                "surprise": likelihood("surpriseLikelihood"),
            })
        })
        .collect()
}

fn shape_detection(params: &DetectionParams, response: &Value) -> Value {
    let objects: Vec<Value> = annotations(response, "localizedObjectAnnotations")
        .iter()
        .filter(|o| score(o, "score") >= params.confidence_threshold)
        .map(|o| {
            json!({
                "name": o.get("name").and_then(Value::as_str).unwrap_or_default(),
                "confidence": score(o, "score"),
                "bounding_box": vertices(o.get("boundingPoly"), "normalizedVertices"),
            })
        })
        .collect();

    let mut result = Map::new();
    result.insert("object_count".into(), json!(objects.len()));
    result.insert("objects".into(), Value::Array(objects));
    if params.include_faces {
        let faces = faces(response, params.confidence_threshold);
        result.insert("face_count".into(), json!(faces.len()));
        result.insert("faces".into(), Value::Array(faces));
    }
    if params.include_labels {
        result.insert(
            "labels".into(),
            Value::Array(labels(response, params.confidence_threshold)),
        );
    }
    result.insert("confidence_threshold".into(), json!(params.confidence_threshold));
    Value::Object(result)
}

fn shape_natural_elements(params: &NaturalElementsParams, response: &Value) -> Value {
    let labels = labels(response, params.confidence_threshold);

    let mut categories = Map::new();
    for label in &labels {
        let description = label["description"].as_str().unwrap_or_default().to_lowercase();
        let confidence = label["confidence"].as_f64().unwrap_or(0.0);
        for (category, keywords) in NATURAL_CATEGORIES {
            if keywords.iter().any(|k| description.contains(k)) {
                let best = categories
                    .get(*category)
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                if confidence > best {
                    categories.insert((*category).to_string(), json!(confidence));
                }
            }
        }
    }
    let natural_score = categories
        .values()
        .filter_map(Value::as_f64)
        .fold(0.0_f64, f64::max);

    let mut result = Map::new();
    result.insert("labels".into(), Value::Array(labels));
    result.insert("natural_elements".into(), Value::Object(categories));
    result.insert("natural_score".into(), json!(natural_score));
    if params.include_colors {
        let colors: Vec<Value> = response
            .pointer("/imagePropertiesAnnotation/dominantColors/colors")
            .and_then(Value::as_array)
            .map(|colors| colors.iter().map(shape_color).collect())
            .unwrap_or_default();
        result.insert("dominant_colors".into(), Value::Array(colors));
    }
    Value::Object(result)
}

fn shape_color(entry: &Value) -> Value {
    let channel = |name: &str| {
        entry
            .pointer(&format!("/color/{}", name))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 255.0) as u8
    };
    let (r, g, b) = (channel("red"), channel("green"), channel("blue"));
    json!({
        "rgb": [r, g, b],
        "hex": format!("#{:02x}{:02x}{:02x}", r, g, b),
        "score": score(entry, "score"),
        "pixel_fraction": score(entry, "pixelFraction"),
    })
}

fn shape_faces(params: &FaceDetectionParams, response: &Value) -> Value {
    let faces = faces(response, params.confidence_threshold);
    json!({
        "face_count": faces.len(),
        "faces": faces,
        "confidence_threshold": params.confidence_threshold,
    })
}
