//! Reference transform kernels.
//!
//! Device builds run vendor implementations of these transforms; the versions
//! here follow the same names, parameter lists and shape rules so that
//! manifests can be executed and checked on the host.

use crate::error::KernelError;
use crate::registry::{KernelArgs, KernelSpec};
use crate::tensor::{Tensor, Value};
use ndarray::{ArrayD, ArrayView3, Dimension, Ix3, IxDyn};

macro_rules! with_tensor {
    ($tensor:expr, $array:ident => $body:expr) => {
        match $tensor {
            Tensor::F32($array) => Tensor::F32($body),
            Tensor::I8($array) => Tensor::I8($body),
        }
    };
}

pub fn reference_kernels() -> Vec<KernelSpec> {
    vec![
        KernelSpec {
            name: "tessellation_transform",
            params: &[
                "data",
                "slice_height",
                "slice_width",
                "slice_channels",
                "align_c16",
            ],
            accepts_unbatched: false,
            func: tessellation,
        },
        KernelSpec {
            name: "detessellation_transform",
            params: &[
                "data",
                "slice_height",
                "slice_width",
                "slice_channels",
                "frame_type",
                "frame_shape",
            ],
            accepts_unbatched: false,
            func: detessellation,
        },
        KernelSpec {
            name: "quantization_transform",
            params: &["frames", "channel_params", "num_bits"],
            accepts_unbatched: false,
            func: quantize,
        },
        KernelSpec {
            name: "dequantization_transform",
            params: &["q_frames", "channel_params"],
            accepts_unbatched: false,
            func: dequantize,
        },
        KernelSpec {
            name: "reshape_transform",
            params: &["newshape", "data"],
            accepts_unbatched: false,
            func: reshape,
        },
        KernelSpec {
            name: "unpack_transform",
            params: &["data", "tensor_types", "tensor_shapes"],
            accepts_unbatched: true,
            func: unpack,
        },
        KernelSpec {
            name: "layout_transform",
            params: &["data", "src_layout", "dst_layout"],
            accepts_unbatched: false,
            func: layout_transform,
        },
    ]
}

fn invalid(name: &str, reason: impl Into<String>) -> KernelError {
    KernelError::InvalidParameter {
        name: name.to_string(),
        reason: reason.into(),
    }
}

struct SliceShape {
    height: usize,
    width: usize,
    channels: usize,
}

impl SliceShape {
    fn from_args(args: &KernelArgs) -> Result<Self, KernelError> {
        let shape = Self {
            height: args.param("slice_height")?,
            width: args.param("slice_width")?,
            channels: args.param("slice_channels")?,
        };
        if shape.height == 0 || shape.width == 0 || shape.channels == 0 {
            return Err(invalid("slice_shape", "slice dimensions must be non-zero"));
        }
        Ok(shape)
    }

    /// Frame coordinates in tile order: tiles row-major over (H, W, C), each
    /// tile row-major inside. `None` marks padding.
    fn walk(
        &self,
        height: usize,
        width: usize,
        channels: usize,
        padded_channels: usize,
        mut visit: impl FnMut(Option<[usize; 3]>),
    ) {
        for tile_y in (0..height).step_by(self.height) {
            for tile_x in (0..width).step_by(self.width) {
                for tile_c in (0..padded_channels).step_by(self.channels) {
                    for y in tile_y..tile_y + self.height {
                        for x in tile_x..tile_x + self.width {
                            for c in tile_c..tile_c + self.channels {
                                if y < height && x < width && c < channels {
                                    visit(Some([y, x, c]));
                                } else {
                                    visit(None);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Views a batch-of-one 4-D tensor (or a bare 3-D one) as HWC.
fn frame_view<T>(array: &ArrayD<T>) -> Result<ArrayView3<'_, T>, KernelError> {
    let view = match array.ndim() {
        4 if array.shape()[0] == 1 => array.index_axis(ndarray::Axis(0), 0),
        3 => array.view(),
        _ => {
            return Err(KernelError::UnsupportedInput(format!(
                "expected a (1, H, W, C) frame, got {:?}",
                array.shape()
            )))
        }
    };
    Ok(view.into_dimensionality::<Ix3>()?)
}

fn tessellate<T: Copy + Default>(
    array: &ArrayD<T>,
    slice: &SliceShape,
    align_c16: bool,
) -> Result<ArrayD<T>, KernelError> {
    let frame = frame_view(array)?;
    let (height, width, channels) = frame.dim();
    let padded_channels = if align_c16 {
        channels.div_ceil(16) * 16
    } else {
        channels
    };

    let mut out = Vec::with_capacity(height * width * padded_channels);
    slice.walk(height, width, channels, padded_channels, |index| {
        out.push(index.map_or_else(T::default, |[y, x, c]| frame[[y, x, c]]));
    });
    let len = out.len();
    Ok(ArrayD::from_shape_vec(IxDyn(&[1, len]), out)?)
}

fn tessellation(args: KernelArgs) -> Result<Value, KernelError> {
    let slice = SliceShape::from_args(&args)?;
    let align_c16: bool = args.param("align_c16")?;
    let tensor = args.tensor()?;
    Ok(Value::Tensor(
        with_tensor!(tensor, a => tessellate(a, &slice, align_c16)?),
    ))
}

fn detessellate<T: Copy + Default>(
    array: &ArrayD<T>,
    slice: &SliceShape,
    frame_shape: [usize; 3],
) -> Result<ArrayD<T>, KernelError> {
    let [height, width, channels] = frame_shape;
    let mut frame = ndarray::Array3::<T>::default((height, width, channels));
    let mut source = array.iter();
    let mut short = false;

    slice.walk(height, width, channels, channels, |index| match source.next() {
        Some(&value) => {
            if let Some([y, x, c]) = index {
                frame[[y, x, c]] = value;
            }
        }
        None => short = true,
    });
    if short {
        return Err(KernelError::UnsupportedInput(format!(
            "{} values cannot fill a tessellated {:?} frame",
            array.len(),
            frame_shape
        )));
    }
    Ok(frame.insert_axis(ndarray::Axis(0)).into_dyn())
}

fn parse_frame_shape(shape: Vec<usize>) -> Result<[usize; 3], KernelError> {
    match shape.as_slice() {
        [h, w, c] | [1, h, w, c] => Ok([*h, *w, *c]),
        _ => Err(invalid(
            "frame_shape",
            format!("expected [H, W, C] or [1, H, W, C], got {:?}", shape),
        )),
    }
}

fn detessellation(args: KernelArgs) -> Result<Value, KernelError> {
    let slice = SliceShape::from_args(&args)?;
    let frame_shape = parse_frame_shape(args.param("frame_shape")?)?;
    let frame_type: String = args.param("frame_type")?;
    let tensor = args.tensor()?;

    let frame = with_tensor!(tensor, a => detessellate(a, &slice, frame_shape)?);
    let frame = match (frame_type.to_uppercase().as_str(), frame) {
        ("INT8", frame @ Tensor::I8(_)) | ("FP32" | "FLOAT32", frame @ Tensor::F32(_)) => frame,
        ("FP32" | "FLOAT32", Tensor::I8(a)) => Tensor::F32(a.mapv(f32::from)),
        (other, frame) => {
            return Err(invalid(
                "frame_type",
                format!("cannot produce {} from {}", other, frame.dtype()),
            ))
        }
    };
    Ok(Value::Tensor(frame))
}

/// Per-channel `(scale, zero_point)` pairs; a single pair applies to all.
fn channel_params(args: &KernelArgs, channels: usize) -> Result<Vec<(f32, f32)>, KernelError> {
    let pairs: Vec<(f32, f32)> = args.param("channel_params")?;
    if pairs.iter().any(|&(scale, _)| scale == 0.0) {
        return Err(invalid("channel_params", "scale must be non-zero"));
    }
    match pairs.len() {
        1 => Ok(vec![pairs[0]; channels]),
        n if n == channels => Ok(pairs),
        n => Err(invalid(
            "channel_params",
            format!("{} pairs for {} channels", n, channels),
        )),
    }
}

fn last_axis_len(shape: &[usize]) -> usize {
    shape.last().copied().unwrap_or(1)
}

fn quantize(args: KernelArgs) -> Result<Value, KernelError> {
    let num_bits: u32 = args.param("num_bits")?;
    if !(1..=8).contains(&num_bits) {
        return Err(invalid("num_bits", format!("{} does not fit int8", num_bits)));
    }
    let frames = match args.tensor()? {
        Tensor::F32(frames) => frames,
        other => {
            return Err(KernelError::UnsupportedInput(format!(
                "quantization expects float32, got {}",
                other
            )))
        }
    };
    let params = channel_params(&args, last_axis_len(frames.shape()))?;
    let low = -(1i32 << (num_bits - 1)) as f32;
    let high = ((1i32 << (num_bits - 1)) - 1) as f32;

    let mut out = ArrayD::<i8>::zeros(frames.raw_dim());
    for ((index, &value), slot) in frames.indexed_iter().zip(out.iter_mut()) {
        let (scale, zero_point) = params[index[index.ndim() - 1]];
        *slot = ((value / scale).round() + zero_point).clamp(low, high) as i8;
    }
    Ok(Value::Tensor(Tensor::I8(out)))
}

fn dequantize_one(tensor: &Tensor, args: &KernelArgs) -> Result<Tensor, KernelError> {
    let q_frames = match tensor {
        Tensor::I8(q_frames) => q_frames,
        other => {
            return Err(KernelError::UnsupportedInput(format!(
                "dequantization expects int8, got {}",
                other
            )))
        }
    };
    let params = channel_params(args, last_axis_len(q_frames.shape()))?;
    let mut out = ArrayD::<f32>::zeros(q_frames.raw_dim());
    for ((index, &value), slot) in q_frames.indexed_iter().zip(out.iter_mut()) {
        let (scale, zero_point) = params[index[index.ndim() - 1]];
        *slot = (f32::from(value) - zero_point) * scale;
    }
    Ok(Tensor::F32(out))
}

fn dequantize(args: KernelArgs) -> Result<Value, KernelError> {
    match &args.data {
        Value::Tensor(tensor) => Ok(Value::Tensor(dequantize_one(tensor, &args)?)),
        Value::List(tensors) => Ok(Value::List(
            tensors
                .iter()
                .map(|tensor| dequantize_one(tensor, &args))
                .collect::<Result<_, _>>()?,
        )),
    }
}

fn resolve_shape(newshape: &[i64], len: usize) -> Result<Vec<usize>, KernelError> {
    let inferred = newshape.iter().filter(|&&d| d == -1).count();
    if inferred > 1 || newshape.iter().any(|&d| d < -1) {
        return Err(invalid("newshape", format!("{:?} is not a shape", newshape)));
    }
    let known: usize = newshape
        .iter()
        .filter(|&&d| d >= 0)
        .map(|&d| d as usize)
        .product();
    newshape
        .iter()
        .map(|&d| {
            if d >= 0 {
                Ok(d as usize)
            } else if known > 0 && len % known == 0 {
                Ok(len / known)
            } else {
                Err(invalid(
                    "newshape",
                    format!("cannot infer {:?} for {} values", newshape, len),
                ))
            }
        })
        .collect()
}

fn reshape(args: KernelArgs) -> Result<Value, KernelError> {
    let newshape: Vec<i64> = args.param("newshape")?;
    let tensor = args.tensor()?;
    let shape = resolve_shape(&newshape, tensor.len())?;
    Ok(Value::Tensor(with_tensor!(
        tensor,
        a => a.to_shape(IxDyn(&shape))?.into_owned()
    )))
}

fn unpack(args: KernelArgs) -> Result<Value, KernelError> {
    let types: Vec<String> = args.param("tensor_types")?;
    let shapes: Vec<Vec<usize>> = args.param("tensor_shapes")?;
    if types.len() != shapes.len() {
        return Err(invalid(
            "tensor_types",
            format!("{} types for {} shapes", types.len(), shapes.len()),
        ));
    }

    let bytes = args.tensor()?.to_bytes();
    let mut offset = 0;
    let mut tensors = Vec::with_capacity(types.len());
    for (dtype, shape) in types.iter().zip(shapes) {
        let count: usize = shape.iter().product();
        let width = match dtype.to_uppercase().as_str() {
            "INT8" => 1,
            "FP32" | "FLOAT32" => 4,
            other => return Err(invalid("tensor_types", format!("unsupported {}", other))),
        };
        let end = offset + count * width;
        let chunk = bytes.get(offset..end).ok_or_else(|| {
            KernelError::UnsupportedInput(format!(
                "{} bytes cannot hold tensor {:?} at offset {}",
                bytes.len(),
                shape,
                offset
            ))
        })?;
        let tensor = if width == 1 {
            let data = chunk.iter().map(|&b| b as i8).collect();
            Tensor::I8(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
        } else {
            let data = chunk
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Tensor::F32(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
        };
        tensors.push(tensor);
        offset = end;
    }
    Ok(Value::List(tensors))
}

fn permutation(src: &str, dst: &str) -> Result<Vec<usize>, KernelError> {
    let mut sorted_src: Vec<char> = src.chars().collect();
    let mut sorted_dst: Vec<char> = dst.chars().collect();
    sorted_src.sort_unstable();
    sorted_dst.sort_unstable();
    if sorted_src != sorted_dst || sorted_src.windows(2).any(|w| w[0] == w[1]) {
        return Err(invalid(
            "dst_layout",
            format!("cannot permute {} into {}", src, dst),
        ));
    }
    Ok(dst
        .chars()
        .filter_map(|axis| src.chars().position(|c| c == axis))
        .collect())
}

fn layout_transform(args: KernelArgs) -> Result<Value, KernelError> {
    let src: String = args.param("src_layout")?;
    let dst: String = args.param("dst_layout")?;
    let mut axes = permutation(&src.to_uppercase(), &dst.to_uppercase())?;
    let tensor = args.tensor()?;

    // A promoted batch axis stays in front of an unbatched layout.
    if tensor.ndim() == axes.len() + 1 && tensor.shape()[0] == 1 {
        axes = std::iter::once(0).chain(axes.iter().map(|a| a + 1)).collect();
    } else if tensor.ndim() != axes.len() {
        return Err(KernelError::UnsupportedInput(format!(
            "layout {} does not match shape {:?}",
            src,
            tensor.shape()
        )));
    }
    Ok(Value::Tensor(with_tensor!(
        tensor,
        a => a.clone().permuted_axes(IxDyn(&axes)).as_standard_layout().into_owned()
    )))
}
