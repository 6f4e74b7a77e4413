//! YOLOX box decoding, class-agnostic NMS and the heatmap top-K decoder.

use crate::error::DetectionError;
use crate::tensor::Tensor;
use ndarray::{concatenate, s, Array2, Array3, ArrayView2, ArrayView4, Axis, Ix4};

/// Raw heatmap scores are 1.15 fixed point.
const HEATMAP_SCALE: f32 = 1.0 / 32768.0;
const HEATMAP_THRESHOLD: f32 = (0.4 * 32768.0) as i32 as f32;

/// One decoded object in original-image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
    pub class_id: usize,
}

/// Concatenates multi-scale `(H, W, C)` or `(1, H, W, C)` outputs into one
/// `(1, N, C)` array, anchors in output order.
pub fn flatten_outputs(outputs: &[Tensor]) -> Result<Array3<f32>, DetectionError> {
    let mut levels = Vec::with_capacity(outputs.len());
    for output in outputs {
        let array = output.to_f32();
        let shape = array.shape().to_vec();
        let (height, width, channels) = match shape.as_slice() {
            [h, w, c] | [1, h, w, c] => (*h, *w, *c),
            _ => {
                return Err(DetectionError::Shape {
                    expected: "(H, W, C) or (1, H, W, C)",
                    shape,
                })
            }
        };
        let level = array
            .into_shape_with_order((1, height * width, channels))
            .map_err(|_| DetectionError::Shape {
                expected: "a contiguous output",
                shape: shape.clone(),
            })?;
        levels.push(level);
    }

    let views: Vec<_> = levels.iter().map(|level| level.view()).collect();
    concatenate(Axis(1), &views).map_err(|_| DetectionError::Shape {
        expected: "outputs with the same channel count",
        shape: levels.first().map(|l| l.shape().to_vec()).unwrap_or_default(),
    })
}

/// Adds the cell grid to the centre offsets and scales centres and sizes by
/// each level's stride. Returns the decoded copy.
pub fn decode_outputs(
    outputs: &Array3<f32>,
    img_size: (usize, usize),
    p6: bool,
) -> Result<Array3<f32>, DetectionError> {
    if outputs.shape()[2] < 4 {
        return Err(DetectionError::Shape {
            expected: "(1, N, C) with C >= 4",
            shape: outputs.shape().to_vec(),
        });
    }
    let strides: &[usize] = if p6 { &[8, 16, 32, 64] } else { &[8, 16, 32] };

    let mut anchors = Vec::new();
    for &stride in strides {
        let (rows, cols) = (img_size.0 / stride, img_size.1 / stride);
        for y in 0..rows {
            for x in 0..cols {
                anchors.push((x as f32, y as f32, stride as f32));
            }
        }
    }
    if anchors.len() != outputs.shape()[1] {
        return Err(DetectionError::AnchorCount {
            img_size,
            expected: anchors.len(),
            got: outputs.shape()[1],
        });
    }

    let mut decoded = outputs.to_owned();
    let mut predictions = decoded.index_axis_mut(Axis(0), 0);
    for (mut row, (x, y, stride)) in predictions.outer_iter_mut().zip(anchors) {
        row[0] = (row[0] + x) * stride;
        row[1] = (row[1] + y) * stride;
        row[2] = row[2].exp() * stride;
        row[3] = row[3].exp() * stride;
    }
    Ok(decoded)
}

fn nms(boxes: &ArrayView2<f32>, scores: &[f32], nms_thr: f32) -> Vec<usize> {
    let area =
        |i: usize| (boxes[[i, 2]] - boxes[[i, 0]] + 1.0) * (boxes[[i, 3]] - boxes[[i, 1]] + 1.0);

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut keep = Vec::new();
    while let Some((&best, rest)) = order.split_first() {
        keep.push(best);
        order = rest
            .iter()
            .copied()
            .filter(|&other| {
                let w = (boxes[[best, 2]].min(boxes[[other, 2]])
                    - boxes[[best, 0]].max(boxes[[other, 0]])
                    + 1.0)
                    .max(0.0);
                let h = (boxes[[best, 3]].min(boxes[[other, 3]])
                    - boxes[[best, 1]].max(boxes[[other, 1]])
                    + 1.0)
                    .max(0.0);
                let inter = w * h;
                inter / (area(best) + area(other) - inter) <= nms_thr
            })
            .collect();
    }
    keep
}

/// Class-agnostic NMS over `(N, 4)` xyxy boxes and `(N, C)` class scores.
/// Rows of the result are `[x1, y1, x2, y2, score, class_id]`; `None` when no
/// box scores above `score_thr`.
pub fn multiclass_nms(
    boxes: &Array2<f32>,
    scores: &Array2<f32>,
    nms_thr: f32,
    score_thr: f32,
) -> Option<Array2<f32>> {
    let mut candidates = Vec::new();
    for (index, row) in scores.outer_iter().enumerate() {
        let best = row
            .iter()
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });
        if let Some((class_id, score)) = best {
            if score > score_thr {
                candidates.push((index, class_id, score));
            }
        }
    }
    if candidates.is_empty() {
        return None;
    }

    let indices: Vec<usize> = candidates.iter().map(|&(index, _, _)| index).collect();
    let valid_boxes = boxes.select(Axis(0), &indices);
    let valid_scores: Vec<f32> = candidates.iter().map(|&(_, _, score)| score).collect();
    let keep = nms(&valid_boxes.view(), &valid_scores, nms_thr);

    let mut dets = Array2::zeros((keep.len(), 6));
    for (mut det, &k) in dets.outer_iter_mut().zip(&keep) {
        det.slice_mut(s![..4]).assign(&valid_boxes.row(k));
        det[4] = candidates[k].2;
        det[5] = candidates[k].1 as f32;
    }
    Some(dets)
}

/// Decodes flattened YOLOX outputs `(1, N, 5 + classes)` into detections.
pub fn yolox_detections(
    outputs: &Array3<f32>,
    img_size: (usize, usize),
    nms_thr: f32,
    score_thr: f32,
) -> Result<Vec<Detection>, DetectionError> {
    if outputs.shape()[2] < 6 {
        return Err(DetectionError::Shape {
            expected: "(1, N, 5 + classes)",
            shape: outputs.shape().to_vec(),
        });
    }
    let decoded = decode_outputs(outputs, img_size, false)?;
    let predictions = decoded.index_axis(Axis(0), 0);

    let centres = predictions.slice(s![.., ..4]);
    let mut boxes = Array2::zeros((centres.nrows(), 4));
    for (mut xyxy, cxcywh) in boxes.outer_iter_mut().zip(centres.outer_iter()) {
        xyxy[0] = cxcywh[0] - cxcywh[2] / 2.0;
        xyxy[1] = cxcywh[1] - cxcywh[3] / 2.0;
        xyxy[2] = cxcywh[0] + cxcywh[2] / 2.0;
        xyxy[3] = cxcywh[1] + cxcywh[3] / 2.0;
    }
    let scores = &predictions.slice(s![.., 5..]) * &predictions.slice(s![.., 4..5]);

    let Some(dets) = multiclass_nms(&boxes, &scores, nms_thr, score_thr) else {
        return Ok(Vec::new());
    };
    Ok(dets
        .outer_iter()
        .map(|det| Detection {
            x: det[0],
            y: det[1],
            width: det[2] - det[0],
            height: det[3] - det[1],
            score: det[4],
            class_id: det[5] as usize,
        })
        .collect())
}

/// Maps model-input coordinates back to the original frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub frame_width: f32,
    pub frame_height: f32,
    pub original_width: f32,
    pub original_height: f32,
}

impl Letterbox {
    fn upscale(&self) -> f32 {
        (self.original_width / self.frame_width).max(self.original_height / self.frame_height)
    }
}

fn as_nhwc<'a>(
    name: &'static str,
    array: &'a ndarray::ArrayD<f32>,
) -> Result<ArrayView4<'a, f32>, DetectionError> {
    array
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| DetectionError::Shape {
            expected: name,
            shape: array.shape().to_vec(),
        })
}

/// Picks the `k` strongest heatmap cells and rebuilds their boxes from the
/// per-cell offset and size maps, all `(1, H, W, _)`.
pub fn heatmap_topk(
    heatmap: &Tensor,
    offset: &Tensor,
    size: &Tensor,
    k: usize,
    letterbox: &Letterbox,
) -> Result<Vec<Detection>, DetectionError> {
    let heatmap = heatmap.to_f32();
    let offset = offset.to_f32();
    let size = size.to_f32();
    let heatmap = as_nhwc("heatmap (1, H, W, C)", &heatmap)?;
    let offset = as_nhwc("offset (1, H, W, 2)", &offset)?;
    let size = as_nhwc("size (1, H, W, 2)", &size)?;
    let (_, rows, cols, _) = heatmap.dim();
    let (_, offset_rows, offset_cols, offset_depth) = offset.dim();
    if (offset_rows, offset_cols) != (rows, cols) || size.dim() != offset.dim() || offset_depth < 2 {
        return Err(DetectionError::Shape {
            expected: "offset and size maps matching the heatmap",
            shape: offset.shape().to_vec(),
        });
    }

    let mut cells: Vec<((usize, usize, usize, usize), f32)> =
        heatmap.indexed_iter().map(|(index, &score)| (index, score)).collect();
    cells.sort_by(|a, b| b.1.total_cmp(&a.1));

    let up = letterbox.upscale();
    let dx = (letterbox.frame_width * up - letterbox.original_width) / 2.0;
    let dy = (letterbox.frame_height * up - letterbox.original_height) / 2.0;

    let mut detections = Vec::with_capacity(k);
    for ((_, row, col, channel), score) in cells.into_iter().take(k) {
        if score < HEATMAP_THRESHOLD {
            break;
        }
        let cx = col as f32 + offset[[0, row, col, 0]];
        let cy = row as f32 + offset[[0, row, col, 1]];
        let width = size[[0, row, col, 0]];
        let height = size[[0, row, col, 1]];

        let x1 = (cx - width / 2.0) * up - dx;
        let y1 = (cy - height / 2.0) * up - dy;
        let (width, height) = (width * up, height * up);

        let x = if x1 > 0.0 { x1.trunc() } else { 0.0 };
        let y = if y1 > 0.0 { y1.trunc() } else { 0.0 };
        let width = if x + width < letterbox.original_width {
            width.trunc()
        } else {
            letterbox.original_width - x
        };
        let height = if y + height < letterbox.original_height {
            height.trunc()
        } else {
            letterbox.original_height - y
        };

        detections.push(Detection {
            x,
            y,
            width,
            height,
            score: score * HEATMAP_SCALE,
            class_id: channel,
        });
    }
    Ok(detections)
}
