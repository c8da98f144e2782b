// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLOv8 ONNX 车辆检测
// 包含: 模型加载、预处理(letterbox)、推理、后处理(解码 + NMS)

use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use fast_image_resize as fr;
use ndarray::{s, Array, ArrayView, Axis, IxDyn};
use ort::execution_providers as ep;
use ort::session::Session;
use ort::value::Tensor;

use super::{filter_detections, non_max_suppression, BBox, Detection, VehicleDetector, COCO_NAMES};
use crate::input::Frame;

const CXYWH_OFFSET: usize = 4;
/// letterbox 填充值
const PAD_VALUE: f32 = 144.0 / 255.0;

/// 模型加载参数
#[derive(Debug, Clone)]
pub struct YOLOv8Options {
    /// 模型输入尺寸 (正方形)
    pub inf_size: u32,
    pub iou_threshold: f32,
    pub cuda: bool,
    pub device_id: i32,
}

impl Default for YOLOv8Options {
    fn default() -> Self {
        Self {
            inf_size: 640,
            iou_threshold: 0.45,
            cuda: false,
            device_id: 0,
        }
    }
}

/// YOLOv8 检测器 (每个运行周期由调度线程独占)
pub struct YOLOv8Detector {
    session: Session,
    options: YOLOv8Options,
    resizer: fr::Resizer,
    // 统计
    count: u64,
    last: Instant,
}

impl YOLOv8Detector {
    pub fn load<P: AsRef<Path>>(model_path: P, options: YOLOv8Options) -> Result<Self> {
        let model_path = model_path.as_ref();
        let builder = Session::builder().context("failed to create ORT session builder")?;
        let builder = if options.cuda {
            builder
                .with_execution_providers([ep::CUDAExecutionProvider::default()
                    .with_device_id(options.device_id)
                    .build()])
                .context("failed to register CUDA execution provider")?
        } else {
            builder
        };
        let session = builder
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load YOLOv8 model {}", model_path.display()))?;

        tracing::info!(
            model = %model_path.display(),
            inf_size = options.inf_size,
            cuda = options.cuda,
            "✅ YOLOv8 检测模型加载成功"
        );

        Ok(Self {
            session,
            options,
            resizer: fr::Resizer::new(),
            count: 0,
            last: Instant::now(),
        })
    }

    /// letterbox: 等比缩放后贴到左上角,其余填充
    fn preprocess(&mut self, frame: &Frame) -> Result<(Array<f32, IxDyn>, f32)> {
        let size = self.options.inf_size;
        let (ratio, w_new, h_new) = scale_wh(frame.width as f32, frame.height as f32, size as f32);
        let (w_new, h_new) = ((w_new as u32).max(1), (h_new as u32).max(1));

        // 拷贝一份源数据,保证输入帧不被修改
        let src_image = fr::images::Image::from_vec_u8(
            frame.width,
            frame.height,
            frame.data.clone(),
            fr::PixelType::U8x3,
        )
        .map_err(|e| anyhow!("invalid frame buffer: {}", e))?;
        let mut dst_image = fr::images::Image::new(w_new, h_new, fr::PixelType::U8x3);
        self.resizer
            .resize(
                &src_image,
                &mut dst_image,
                &fr::ResizeOptions::new()
                    .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear)),
            )
            .map_err(|e| anyhow!("resize failed: {}", e))?;

        let mut ys = Array::from_elem((1, 3, size as usize, size as usize), PAD_VALUE).into_dyn();
        for (i, px) in dst_image.buffer().chunks_exact(3).enumerate() {
            let x = i % w_new as usize;
            let y = i / w_new as usize;
            ys[[0, 0, y, x]] = px[0] as f32 / 255.0;
            ys[[0, 1, y, x]] = px[1] as f32 / 255.0;
            ys[[0, 2, y, x]] = px[2] as f32 / 255.0;
        }
        Ok((ys, ratio))
    }

    fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<(Vec<usize>, Vec<f32>)> {
        let size = self.options.inf_size as usize;
        let (data, _) = xs.into_raw_vec_and_offset();
        let input = Tensor::from_array(([1usize, 3, size, size], data.into_boxed_slice()))
            .context("failed to create input tensor")?;

        let outputs = self
            .session
            .run(ort::inputs!["images" => input])
            .context("YOLOv8 inference failed")?;
        let (_, output) = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("YOLOv8 produced no outputs"))?;
        let (shape, values) = output
            .try_extract_tensor::<f32>()
            .context("failed to extract YOLOv8 output tensor")?;

        let dims = shape.iter().map(|&d| d.max(0) as usize).collect::<Vec<_>>();
        Ok((dims, values.to_vec()))
    }

    fn postprocess(
        &self,
        dims: &[usize],
        values: &[f32],
        ratio: f32,
        frame: &Frame,
        min_confidence: f32,
        allowed_labels: &[String],
    ) -> Result<Vec<Detection>> {
        let preds = ArrayView::from_shape(IxDyn(dims), values)
            .context("unexpected YOLOv8 output shape")?;
        decode_predictions(
            preds,
            ratio,
            (frame.width as f32, frame.height as f32),
            min_confidence,
            allowed_labels,
            self.options.iou_threshold,
        )
    }
}

impl VehicleDetector for YOLOv8Detector {
    fn detect(
        &mut self,
        frame: &Frame,
        min_confidence: f32,
        allowed_labels: &[String],
    ) -> Result<Vec<Detection>> {
        if !frame.is_valid() {
            return Err(anyhow!(
                "malformed frame {}x{} ({} bytes)",
                frame.width,
                frame.height,
                frame.data.len()
            ));
        }

        let t0 = Instant::now();
        let (xs, ratio) = self.preprocess(frame)?;
        let (dims, values) = self.run(xs)?;
        let detections =
            self.postprocess(&dims, &values, ratio, frame, min_confidence, allowed_labels)?;
        let detections = filter_detections(detections, min_confidence, allowed_labels);

        self.count += 1;
        if self.last.elapsed().as_secs() >= 10 {
            let fps = self.count as f64 / self.last.elapsed().as_secs_f64();
            tracing::debug!(
                fps = %format!("{:.1}", fps),
                last_ms = %format!("{:.1}", t0.elapsed().as_secs_f64() * 1000.0),
                "🎯 检测性能"
            );
            self.count = 0;
            self.last = Instant::now();
        }

        Ok(detections)
    }

    fn name(&self) -> &str {
        "yolov8"
    }
}

/// 等比缩放系数与缩放后尺寸
fn scale_wh(w0: f32, h0: f32, size: f32) -> (f32, f32, f32) {
    let r = (size / w0).min(size / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

/// 解码 `[1, 4 + nc, anchors]` 输出 → 原图坐标检测框
///
/// 先按置信度与允许类别筛选候选,再按类别做NMS,
/// 非车辆类别不会参与抑制。
fn decode_predictions(
    preds: ArrayView<f32, IxDyn>,
    ratio: f32,
    (width_original, height_original): (f32, f32),
    min_confidence: f32,
    allowed_labels: &[String],
    iou_threshold: f32,
) -> Result<Vec<Detection>> {
    if preds.ndim() != 3 || preds.shape()[1] <= CXYWH_OFFSET {
        return Err(anyhow!("unexpected YOLOv8 output shape {:?}", preds.shape()));
    }
    let nc = preds.shape()[1] - CXYWH_OFFSET;

    let mut data: Vec<Detection> = Vec::new();
    for anchor in preds.axis_iter(Axis(0)) {
        for pred in anchor.axis_iter(Axis(1)) {
            let bbox = pred.slice(s![0..CXYWH_OFFSET]);
            let clss = pred.slice(s![CXYWH_OFFSET..CXYWH_OFFSET + nc]);

            let Some((id, &confidence)) = clss
                .into_iter()
                .enumerate()
                .reduce(|max, x| if x.1 > max.1 { x } else { max })
            else {
                continue;
            };
            if confidence < min_confidence {
                continue;
            }
            let label = COCO_NAMES.get(id).copied().unwrap_or("unknown");
            if !allowed_labels.iter().any(|l| l == label) {
                continue;
            }

            let cx = bbox[0] / ratio;
            let cy = bbox[1] / ratio;
            let w = bbox[2] / ratio;
            let h = bbox[3] / ratio;
            let b = BBox::new(cx - w / 2., cy - h / 2., cx + w / 2., cy + h / 2.)
                .clamp(width_original, height_original);
            if !b.is_valid() {
                continue;
            }

            data.push(Detection::new(label, id, confidence, b));
        }
    }

    non_max_suppression(&mut data, iou_threshold);
    Ok(data)
}
