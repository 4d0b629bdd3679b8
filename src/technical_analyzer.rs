//! 单帧技术质量分析
//!
//! 所有指标都在 RGB 像素上计算，灰度转换、拉普拉斯算子、Sobel 算子和 HSV 饱和度
//! 的定义与 OpenCV 对 8 位图像的默认行为一致（边界按 reflect-101 处理）。

use anyhow::{Context, Result};
use image::{imageops::FilterType, GrayImage, Luma, RgbImage};
use imageproc::binary_descriptors::brief::{brief, TestPair};
use imageproc::corners::{corners_fast9, Corner};
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::error::panic_message;
use crate::segmenter::load_object_segmenter;

/// 质量分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityCategory {
    Good,
    Average,
    Bad,
}

/// 色温分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureCategory {
    Neutral,
    ProbablyWarm,
    Warm,
    ProbablyCold,
    Cold,
}

/// 镜头类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LensType {
    #[serde(rename = "standard lens")]
    Standard,
    #[serde(rename = "fisheye lens")]
    Fisheye,
    #[serde(rename = "wide-angle lens")]
    WideAngle,
    #[serde(rename = "unknown")]
    Unknown,
}

impl LensType {
    pub fn from_class(class: i64) -> Self {
        match class {
            0 => LensType::Standard,
            1 => LensType::Fisheye,
            2 => LensType::WideAngle,
            _ => LensType::Unknown,
        }
    }
}

/// 景别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShotType {
    #[serde(rename = "long shot")]
    LongShot,
    #[serde(rename = "wide shot")]
    WideShot,
    #[serde(rename = "medium shot")]
    MediumShot,
    #[serde(rename = "close-up")]
    CloseUp,
}

impl ShotType {
    /// 根据主体面积占比（百分比）判断景别
    pub fn from_objects_percentage(percentage: f64) -> Self {
        if percentage < 5.0 {
            ShotType::LongShot
        } else if percentage < 15.0 {
            ShotType::WideShot
        } else if percentage < 40.0 {
            ShotType::MediumShot
        } else {
            ShotType::CloseUp
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorDistribution {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

/// 单帧技术指标
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalMetrics {
    pub clarity: f64,
    pub contrast: f64,
    pub brightness: f64,
    pub sharpness: f64,
    pub saturation: f64,
    pub color_balance_metric: f64,
    pub color_distribution: ColorDistribution,
    pub color_temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lens_type: Option<LensType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_objects_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shot_type: Option<ShotType>,
    pub clarity_category: QualityCategory,
    pub contrast_category: QualityCategory,
    pub brightness_category: QualityCategory,
    pub color_temperature_category: TemperatureCategory,
    pub saturation_category: QualityCategory,
    pub sharpness_category: QualityCategory,
}

pub fn clarity_category(clarity: f64) -> QualityCategory {
    if clarity > 400.0 {
        QualityCategory::Good
    } else if clarity > 200.0 {
        QualityCategory::Average
    } else {
        QualityCategory::Bad
    }
}

pub fn sharpness_category(sharpness: f64) -> QualityCategory {
    if sharpness > 400.0 {
        QualityCategory::Good
    } else if sharpness > 200.0 {
        QualityCategory::Average
    } else {
        QualityCategory::Bad
    }
}

pub fn contrast_category(contrast: f64) -> QualityCategory {
    if contrast > 40.0 {
        QualityCategory::Good
    } else if contrast > 20.0 {
        QualityCategory::Average
    } else {
        QualityCategory::Bad
    }
}

pub fn brightness_category(brightness: f64) -> QualityCategory {
    if (0.3..=0.7).contains(&brightness) {
        QualityCategory::Good
    } else if (0.2..0.3).contains(&brightness) || (brightness > 0.7 && brightness <= 0.8) {
        QualityCategory::Average
    } else {
        QualityCategory::Bad
    }
}

pub fn saturation_category(saturation: f64) -> QualityCategory {
    if (0.4..=0.7).contains(&saturation) {
        QualityCategory::Good
    } else if (0.2..0.4).contains(&saturation) {
        QualityCategory::Average
    } else {
        QualityCategory::Bad
    }
}

pub fn temperature_category(temperature: f64) -> TemperatureCategory {
    if (-0.2..=0.2).contains(&temperature) {
        TemperatureCategory::Neutral
    } else if temperature > 0.2 && temperature <= 0.3 {
        TemperatureCategory::ProbablyWarm
    } else if (-0.3..-0.2).contains(&temperature) {
        TemperatureCategory::ProbablyCold
    } else if temperature > 0.3 {
        TemperatureCategory::Warm
    } else {
        TemperatureCategory::Cold
    }
}

/// 可选子模型：构造时确定是否可用，之后不再重复探测
pub enum SubModel<T> {
    Available(T),
    Unavailable,
}

impl<T> SubModel<T> {
    pub fn as_available(&self) -> Option<&T> {
        match self {
            SubModel::Available(model) => Some(model),
            SubModel::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, SubModel::Available(_))
    }
}

impl<T> From<Option<T>> for SubModel<T> {
    fn from(model: Option<T>) -> Self {
        match model {
            Some(model) => SubModel::Available(model),
            None => SubModel::Unavailable,
        }
    }
}

/// 镜头类型分类器，返回类别编号
pub trait LensClassifier: Send + Sync {
    fn predict(&self, frame: &RgbImage) -> Result<i64>;
}

/// 实例分割模型，返回每个检测到的物体掩码占画面的比例（0-1）
pub trait ObjectSegmenter: Send + Sync {
    fn mask_fractions(&self, frame: &RgbImage) -> Result<Vec<f64>>;
}

/// 灰度平面，像素值为 0-255 的整数（以 f64 存储）
struct GrayPlane {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl GrayPlane {
    fn from_rgb(frame: &RgbImage) -> Self {
        let data = frame
            .pixels()
            .map(|p| {
                let y = 0.299 * p[0] as f64 + 0.587 * p[1] as f64 + 0.114 * p[2] as f64;
                y.round().clamp(0.0, 255.0)
            })
            .collect();
        Self {
            width: frame.width() as usize,
            height: frame.height() as usize,
            data,
        }
    }

    fn to_gray_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            Luma([self.data[y as usize * self.width + x as usize] as u8])
        })
    }

    fn at_reflect(&self, x: isize, y: isize) -> f64 {
        let x = reflect_101(x, self.width);
        let y = reflect_101(y, self.height);
        self.data[y * self.width + x]
    }

    /// 3x3 卷积，边界按 reflect-101 处理
    fn convolve3(&self, kernel: &[[f64; 3]; 3]) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.data.len());
        for y in 0..self.height as isize {
            for x in 0..self.width as isize {
                let mut acc = 0.0;
                for (ky, row) in kernel.iter().enumerate() {
                    for (kx, weight) in row.iter().enumerate() {
                        if *weight != 0.0 {
                            acc += weight * self.at_reflect(x + kx as isize - 1, y + ky as isize - 1);
                        }
                    }
                }
                out.push(acc);
            }
        }
        out
    }
}

fn reflect_101(mut i: isize, n: usize) -> usize {
    let n = n as isize;
    if n == 1 {
        return 0;
    }
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * (n - 1) - i;
        }
    }
    i as usize
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// 总体方差
fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64
}

const LAPLACIAN_KERNEL: [[f64; 3]; 3] = [[0.0, 1.0, 0.0], [1.0, -4.0, 1.0], [0.0, 1.0, 0.0]];

// dx=1, dy=1, ksize=3 的 Sobel 核：[-1, 0, 1] 与自身的外积
const SOBEL_XY_KERNEL: [[f64; 3]; 3] = [[1.0, 0.0, -1.0], [0.0, 0.0, 0.0], [-1.0, 0.0, 1.0]];

fn clarity(gray: &GrayPlane) -> f64 {
    variance(&gray.convolve3(&LAPLACIAN_KERNEL))
}

fn sharpness(gray: &GrayPlane) -> f64 {
    variance(&gray.convolve3(&SOBEL_XY_KERNEL))
}

fn contrast(gray: &GrayPlane) -> f64 {
    variance(&gray.data).sqrt()
}

fn brightness(gray: &GrayPlane) -> f64 {
    mean(&gray.data) / 255.0
}

/// HSV 饱和度通道均值 / 255（S = (max - min) / max * 255，四舍五入）
fn saturation(frame: &RgbImage) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for p in frame.pixels() {
        let max = p[0].max(p[1]).max(p[2]) as f64;
        let min = p[0].min(p[1]).min(p[2]) as f64;
        let s = if max > 0.0 {
            ((max - min) / max * 255.0).round()
        } else {
            0.0
        };
        sum += s;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    sum / count as f64 / 255.0
}

fn channel_means(frame: &RgbImage) -> [f64; 3] {
    let mut sums = [0.0f64; 3];
    for p in frame.pixels() {
        for (c, sum) in sums.iter_mut().enumerate() {
            *sum += p[c] as f64;
        }
    }
    let n = (frame.width() as f64 * frame.height() as f64).max(1.0);
    [sums[0] / n, sums[1] / n, sums[2] / n]
}

fn color_balance(means: [f64; 3]) -> f64 {
    let [c0, c1, c2] = means;
    let brightness_mean = (c0 + c1 + c2) / 3.0;
    if brightness_mean > 0.0 {
        ((c2 - c1).abs() + (c1 - c0).abs() + (c0 - c2).abs()) / brightness_mean / 6.0
    } else {
        0.0
    }
}

fn color_temperature(means: [f64; 3]) -> f64 {
    let [red, _, blue] = means;
    (red - blue) / (red + blue + 1e-8)
}

/// 缩放到不超过 `target` 的尺寸，宽高向下取整到 32 的倍数
pub fn resize_for_segmenter(frame: &RgbImage, target: u32) -> RgbImage {
    let (w, h) = (frame.width() as f64, frame.height() as f64);
    let scale = (target as f64 / h).min(target as f64 / w);
    let new_w = (((w * scale) as u32) / 32 * 32).max(32);
    let new_h = (((h * scale) as u32) / 32 * 32).max(32);
    image::imageops::resize(frame, new_w, new_h, FilterType::Triangle)
}

const LENS_INPUT_SIZE: usize = 512;

/// HOG 特征长度：15x15 个块，每块 2x2 个单元，每单元 9 个方向
pub const HOG_FEATURE_LEN: usize = 15 * 15 * 4 * 9;
/// 关键点梯度描述子长度：4x4 个子区域，每个子区域 8 个方向
pub const GRADIENT_DESCRIPTOR_LEN: usize = 128;
const BRIEF_BITS: usize = 256;
/// BRIEF 描述子按字节展开后的长度
pub const BRIEF_DESCRIPTOR_LEN: usize = BRIEF_BITS / 8;
/// 镜头分类特征总长度
pub const LENS_FEATURE_LEN: usize = HOG_FEATURE_LEN + GRADIENT_DESCRIPTOR_LEN + BRIEF_DESCRIPTOR_LEN;

const FAST_THRESHOLD: u8 = 20;
const MAX_KEYPOINTS: usize = 500;
const KEYPOINT_MARGIN: u32 = 32;

fn lens_input(frame: &RgbImage) -> GrayPlane {
    let size = LENS_INPUT_SIZE as u32;
    GrayPlane::from_rgb(&image::imageops::resize(frame, size, size, FilterType::Triangle))
}

/// HOG 特征：512x512 灰度图，9 个方向，32x32 像素单元，2x2 单元块，L2-Hys 归一化
pub fn hog_features(frame: &RgbImage) -> Vec<f64> {
    hog_from_gray(&lens_input(frame))
}

fn hog_from_gray(gray: &GrayPlane) -> Vec<f64> {
    const SIZE: usize = LENS_INPUT_SIZE;
    const CELL: usize = 32;
    const ORIENTATIONS: usize = 9;
    const BLOCK: usize = 2;

    let cells = SIZE / CELL;
    let mut histograms = vec![0.0f64; cells * cells * ORIENTATIONS];
    let bin_width = 180.0 / ORIENTATIONS as f64;

    for y in 0..SIZE {
        for x in 0..SIZE {
            let gx = if x == 0 || x == SIZE - 1 {
                0.0
            } else {
                gray.data[y * SIZE + x + 1] - gray.data[y * SIZE + x - 1]
            };
            let gy = if y == 0 || y == SIZE - 1 {
                0.0
            } else {
                gray.data[(y + 1) * SIZE + x] - gray.data[(y - 1) * SIZE + x]
            };
            let magnitude = gx.hypot(gy);
            if magnitude == 0.0 {
                continue;
            }
            let orientation = gy.atan2(gx).to_degrees().rem_euclid(180.0);
            let bin = ((orientation / bin_width) as usize).min(ORIENTATIONS - 1);
            let cell = (y / CELL) * cells + x / CELL;
            histograms[cell * ORIENTATIONS + bin] += magnitude;
        }
    }

    let cell_area = (CELL * CELL) as f64;
    for value in histograms.iter_mut() {
        *value /= cell_area;
    }

    let blocks = cells - BLOCK + 1;
    let mut features = Vec::with_capacity(HOG_FEATURE_LEN);
    for by in 0..blocks {
        for bx in 0..blocks {
            let mut block = Vec::with_capacity(BLOCK * BLOCK * ORIENTATIONS);
            for cy in by..by + BLOCK {
                for cx in bx..bx + BLOCK {
                    let start = (cy * cells + cx) * ORIENTATIONS;
                    block.extend_from_slice(&histograms[start..start + ORIENTATIONS]);
                }
            }
            l2_hys(&mut block);
            features.extend(block);
        }
    }
    features
}

fn l2_hys(block: &mut [f64]) {
    const EPS: f64 = 1e-5;
    let norm = (block.iter().map(|v| v * v).sum::<f64>() + EPS * EPS).sqrt();
    for v in block.iter_mut() {
        *v = (*v / norm).min(0.2);
    }
    let norm = (block.iter().map(|v| v * v).sum::<f64>() + EPS * EPS).sqrt();
    for v in block.iter_mut() {
        *v /= norm;
    }
}

/// FAST-9 角点，去掉靠近边缘的点，按响应强度保留前 500 个
fn detect_keypoints(image: &GrayImage) -> Vec<Point<u32>> {
    let (width, height) = image.dimensions();
    let mut corners: Vec<Corner> = corners_fast9(image, FAST_THRESHOLD)
        .into_iter()
        .filter(|c| {
            c.x >= KEYPOINT_MARGIN
                && c.y >= KEYPOINT_MARGIN
                && c.x + KEYPOINT_MARGIN < width
                && c.y + KEYPOINT_MARGIN < height
        })
        .collect();
    corners.sort_by(|a, b| b.score.total_cmp(&a.score));
    corners.truncate(MAX_KEYPOINTS);
    corners.into_iter().map(|c| Point::new(c.x, c.y)).collect()
}

/// 关键点周围 16x16 窗口的梯度方向直方图（4x4 子区域 x 8 个方向）
fn gradient_descriptor(gray: &GrayPlane, keypoint: Point<u32>) -> [f64; GRADIENT_DESCRIPTOR_LEN] {
    const WINDOW: usize = 16;
    const SUB: usize = 4;
    const BINS: usize = 8;

    let mut descriptor = [0.0f64; GRADIENT_DESCRIPTOR_LEN];
    let left = keypoint.x as usize - WINDOW / 2;
    let top = keypoint.y as usize - WINDOW / 2;
    let at = |x: usize, y: usize| gray.data[y * gray.width + x];

    for dy in 0..WINDOW {
        for dx in 0..WINDOW {
            let (x, y) = (left + dx, top + dy);
            let gx = at(x + 1, y) - at(x - 1, y);
            let gy = at(x, y + 1) - at(x, y - 1);
            let magnitude = gx.hypot(gy);
            if magnitude == 0.0 {
                continue;
            }
            let orientation = gy.atan2(gx).to_degrees().rem_euclid(360.0);
            let bin = ((orientation / (360.0 / BINS as f64)) as usize).min(BINS - 1);
            let cell = (dy / SUB) * (WINDOW / SUB) + dx / SUB;
            descriptor[cell * BINS + bin] += magnitude;
        }
    }

    if descriptor.iter().any(|v| *v > 0.0) {
        l2_hys(&mut descriptor);
        for v in descriptor.iter_mut() {
            *v = (*v * 512.0).min(255.0);
        }
    }
    descriptor
}

/// 固定的 BRIEF 采样点对：31x31 图块内，按黄金角分布在以中心为圆心的同心圆上
fn brief_test_pairs() -> Vec<TestPair> {
    const CENTER: f64 = 15.0;
    const GOLDEN_ANGLE: f64 = 2.399_963_229_728_653;

    let point = |radius: f64, angle: f64| {
        Point::new(
            (CENTER + radius * angle.cos()).round() as u32,
            (CENTER + radius * angle.sin()).round() as u32,
        )
    };
    (0..BRIEF_BITS)
        .map(|i| {
            let angle = i as f64 * GOLDEN_ANGLE;
            let r0 = 2.0 + (i % 13) as f64;
            let r1 = 2.0 + ((i * 7 + 3) % 13) as f64;
            let offset = std::f64::consts::FRAC_PI_2 * (1.0 + (i % 3) as f64 * 0.5);
            TestPair {
                p0: point(r0, angle),
                p1: point(r1, angle + offset),
            }
        })
        .collect()
}

/// 镜头分类特征：HOG + 关键点梯度描述子均值 + BRIEF 描述子均值
///
/// 没有检测到关键点时两个描述子均值都取全 0。
pub struct LensFeatureExtractor {
    test_pairs: Vec<TestPair>,
}

impl Default for LensFeatureExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl LensFeatureExtractor {
    pub fn new() -> Self {
        Self {
            test_pairs: brief_test_pairs(),
        }
    }

    pub fn extract(&self, frame: &RgbImage) -> Result<Vec<f64>> {
        let gray = lens_input(frame);
        let mut features = hog_from_gray(&gray);

        let gray_image = gray.to_gray_image();
        let keypoints = detect_keypoints(&gray_image);

        let mut gradient_mean = [0.0f64; GRADIENT_DESCRIPTOR_LEN];
        let mut brief_mean = [0.0f64; BRIEF_DESCRIPTOR_LEN];
        if !keypoints.is_empty() {
            for keypoint in &keypoints {
                let descriptor = gradient_descriptor(&gray, *keypoint);
                for (m, v) in gradient_mean.iter_mut().zip(descriptor.iter()) {
                    *m += v;
                }
            }
            for m in gradient_mean.iter_mut() {
                *m /= keypoints.len() as f64;
            }

            let (descriptors, _) = brief(&gray_image, &keypoints, BRIEF_BITS, Some(&self.test_pairs))
                .map_err(|e| anyhow::anyhow!("BRIEF 描述子计算失败: {}", e))?;
            for descriptor in &descriptors {
                for (j, m) in brief_mean.iter_mut().enumerate() {
                    let word = descriptor.bits[j / 16];
                    *m += ((word >> ((j % 16) * 8)) & 0xFF) as f64;
                }
            }
            if !descriptors.is_empty() {
                for m in brief_mean.iter_mut() {
                    *m /= descriptors.len() as f64;
                }
            }
        }

        features.extend_from_slice(&gradient_mean);
        features.extend_from_slice(&brief_mean);
        Ok(features)
    }
}

/// 线性 SVM 模型文件格式（一对多，每个类别一组权重）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSvmModel {
    pub classes: Vec<i64>,
    pub weights: Vec<Vec<f64>>,
    pub intercepts: Vec<f64>,
}

/// 基于镜头特征的线性 SVM 镜头分类器
pub struct LinearSvmLensClassifier {
    model: LinearSvmModel,
    features: LensFeatureExtractor,
}
impl LinearSvmLensClassifier {
    pub fn from_model(model: LinearSvmModel) -> Result<Self> {
        if model.classes.is_empty() {
            anyhow::bail!("SVM 模型没有类别");
        }
        if model.weights.len() != model.classes.len() || model.intercepts.len() != model.classes.len() {
            anyhow::bail!(
                "SVM 模型维度不一致: classes={}, weights={}, intercepts={}",
                model.classes.len(),
                model.weights.len(),
                model.intercepts.len()
            );
        }
        Ok(Self {
            model,
            features: LensFeatureExtractor::new(),
        })
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("读取 SVM 模型失败: {}", path.display()))?;
        let model: LinearSvmModel =
            serde_json::from_str(&raw).with_context(|| format!("解析 SVM 模型失败: {}", path.display()))?;
        Self::from_model(model)
    }

    fn predict_features(&self, features: &[f64]) -> Result<i64> {
        let mut best: Option<(usize, f64)> = None;
        for (i, (weights, intercept)) in self
            .model
            .weights
            .iter()
            .zip(&self.model.intercepts)
            .enumerate()
        {
            if weights.len() != features.len() {
                anyhow::bail!("特征长度不匹配: 模型 {}，实际 {}", weights.len(), features.len());
            }
            let score = weights.iter().zip(features).map(|(w, x)| w * x).sum::<f64>() + intercept;
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((i, score));
            }
        }
        let (i, _) = best.context("SVM 模型没有类别")?;
        Ok(self.model.classes[i])
    }
}

impl LensClassifier for LinearSvmLensClassifier {
    fn predict(&self, frame: &RgbImage) -> Result<i64> {
        self.predict_features(&self.features.extract(frame)?)
    }
}

/// 技术分析器
pub struct TechnicalFrameAnalyzer {
    lens_classifier: SubModel<Box<dyn LensClassifier>>,
    object_segmenter: SubModel<Box<dyn ObjectSegmenter>>,
}

impl Default for TechnicalFrameAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl TechnicalFrameAnalyzer {
    /// 只计算基础指标，不带任何子模型
    pub fn new() -> Self {
        Self {
            lens_classifier: SubModel::Unavailable,
            object_segmenter: SubModel::Unavailable,
        }
    }

    pub fn with_lens_classifier(mut self, classifier: Box<dyn LensClassifier>) -> Self {
        self.lens_classifier = SubModel::Available(classifier);
        self
    }

    pub fn with_object_segmenter(mut self, segmenter: Box<dyn ObjectSegmenter>) -> Self {
        self.object_segmenter = SubModel::Available(segmenter);
        self
    }

    /// 按配置加载子模型，加载失败只记录警告
    pub fn from_config(config: &ModelConfig) -> Self {
        let mut analyzer = Self::new();
        if let Some(path) = &config.lens_model_path {
            match LinearSvmLensClassifier::from_json_file(path) {
                Ok(classifier) => {
                    info!("🔍 [技术分析] 已加载镜头分类模型: {}", path.display());
                    analyzer = analyzer.with_lens_classifier(Box::new(classifier));
                }
                Err(e) => warn!("⚠️  [技术分析] 无法加载镜头分类模型 {}: {:#}", path.display(), e),
            }
        }
        match load_object_segmenter(config) {
            Ok(Some(segmenter)) => analyzer = analyzer.with_object_segmenter(segmenter),
            Ok(None) => {}
            Err(e) => warn!("⚠️  [技术分析] 无法加载分割模型: {:#}", e),
        }
        analyzer
    }

    pub fn has_lens_classifier(&self) -> bool {
        self.lens_classifier.is_available()
    }

    pub fn has_object_segmenter(&self) -> bool {
        self.object_segmenter.is_available()
    }

    /// 分析单帧，空图像返回 None
    pub fn analyze_frame(&self, frame: &RgbImage) -> Option<TechnicalMetrics> {
        if frame.width() == 0 || frame.height() == 0 {
            return None;
        }

        let gray = GrayPlane::from_rgb(frame);
        let clarity = clarity(&gray);
        let contrast = contrast(&gray);
        let brightness = brightness(&gray);
        let sharpness = sharpness(&gray);
        let saturation = saturation(frame);

        let means = channel_means(frame);
        let color_temperature = color_temperature(means);

        let lens_type = self.classify_lens(frame);
        let main_objects_percentage = self.main_objects_percentage(frame);

        Some(TechnicalMetrics {
            clarity,
            contrast,
            brightness,
            sharpness,
            saturation,
            color_balance_metric: color_balance(means),
            color_distribution: ColorDistribution {
                r: means[0] / 255.0,
                g: means[1] / 255.0,
                b: means[2] / 255.0,
            },
            color_temperature,
            lens_type,
            main_objects_percentage,
            shot_type: main_objects_percentage.map(ShotType::from_objects_percentage),
            clarity_category: clarity_category(clarity),
            contrast_category: contrast_category(contrast),
            brightness_category: brightness_category(brightness),
            color_temperature_category: temperature_category(color_temperature),
            saturation_category: saturation_category(saturation),
            sharpness_category: sharpness_category(sharpness),
        })
    }

    fn classify_lens(&self, frame: &RgbImage) -> Option<LensType> {
        let classifier = self.lens_classifier.as_available()?;
        match panic::catch_unwind(AssertUnwindSafe(|| classifier.predict(frame))) {
            Ok(Ok(class)) => Some(LensType::from_class(class)),
            Ok(Err(e)) => {
                warn!("⚠️  [技术分析] 镜头类型分类失败: {:#}", e);
                None
            }
            Err(payload) => {
                warn!("⚠️  [技术分析] 镜头类型分类异常退出: {}", panic_message(payload.as_ref()));
                None
            }
        }
    }

    fn main_objects_percentage(&self, frame: &RgbImage) -> Option<f64> {
        let segmenter = self.object_segmenter.as_available()?;
        let resized = resize_for_segmenter(frame, 416);
        match panic::catch_unwind(AssertUnwindSafe(|| segmenter.mask_fractions(&resized))) {
            Ok(Ok(mut fractions)) => {
                fractions.sort_by(|a, b| b.total_cmp(a));
                Some(fractions.iter().take(5).sum::<f64>() * 100.0)
            }
            Ok(Err(e)) => {
                warn!("⚠️  [技术分析] 物体分析失败: {:#}", e);
                None
            }
            Err(payload) => {
                warn!("⚠️  [技术分析] 物体分析异常退出: {}", panic_message(payload.as_ref()));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn solid(r: u8, g: u8, b: u8) -> RgbImage {
        ImageBuffer::from_fn(32, 24, |_, _| Rgb([r, g, b]))
    }

    struct FixedLens(i64);

    impl LensClassifier for FixedLens {
        fn predict(&self, _frame: &RgbImage) -> Result<i64> {
            Ok(self.0)
        }
    }

    struct BrokenLens;

    impl LensClassifier for BrokenLens {
        fn predict(&self, _frame: &RgbImage) -> Result<i64> {
            anyhow::bail!("model exploded")
        }
    }

    struct FixedMasks(Vec<f64>);

    impl ObjectSegmenter for FixedMasks {
        fn mask_fractions(&self, frame: &RgbImage) -> Result<Vec<f64>> {
            assert_eq!(frame.width() % 32, 0);
            assert_eq!(frame.height() % 32, 0);
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_quality_categories() {
        assert_eq!(clarity_category(450.0), QualityCategory::Good);
        assert_eq!(clarity_category(250.0), QualityCategory::Average);
        assert_eq!(clarity_category(50.0), QualityCategory::Bad);
        assert_eq!(clarity_category(400.0), QualityCategory::Average);
        assert_eq!(sharpness_category(401.0), QualityCategory::Good);
        assert_eq!(sharpness_category(200.0), QualityCategory::Bad);
        assert_eq!(contrast_category(41.0), QualityCategory::Good);
        assert_eq!(contrast_category(30.0), QualityCategory::Average);
        assert_eq!(contrast_category(20.0), QualityCategory::Bad);
    }

    #[test]
    fn test_brightness_and_saturation_ranges() {
        assert_eq!(brightness_category(0.3), QualityCategory::Good);
        assert_eq!(brightness_category(0.7), QualityCategory::Good);
        assert_eq!(brightness_category(0.25), QualityCategory::Average);
        assert_eq!(brightness_category(0.75), QualityCategory::Average);
        assert_eq!(brightness_category(0.8), QualityCategory::Average);
        assert_eq!(brightness_category(0.85), QualityCategory::Bad);
        assert_eq!(brightness_category(0.1), QualityCategory::Bad);

        assert_eq!(saturation_category(0.4), QualityCategory::Good);
        assert_eq!(saturation_category(0.3), QualityCategory::Average);
        assert_eq!(saturation_category(0.1), QualityCategory::Bad);
        assert_eq!(saturation_category(0.8), QualityCategory::Bad);
    }

    #[test]
    fn test_temperature_categories() {
        assert_eq!(temperature_category(0.25), TemperatureCategory::ProbablyWarm);
        assert_eq!(temperature_category(-0.35), TemperatureCategory::Cold);
        assert_eq!(temperature_category(0.0), TemperatureCategory::Neutral);
        assert_eq!(temperature_category(0.2), TemperatureCategory::Neutral);
        assert_eq!(temperature_category(-0.2), TemperatureCategory::Neutral);
        assert_eq!(temperature_category(0.3), TemperatureCategory::ProbablyWarm);
        assert_eq!(temperature_category(0.31), TemperatureCategory::Warm);
        assert_eq!(temperature_category(-0.25), TemperatureCategory::ProbablyCold);
        assert_eq!(temperature_category(-0.3), TemperatureCategory::ProbablyCold);
    }

    #[test]
    fn test_lens_and_shot_mapping() {
        assert_eq!(LensType::from_class(0), LensType::Standard);
        assert_eq!(LensType::from_class(1), LensType::Fisheye);
        assert_eq!(LensType::from_class(2), LensType::WideAngle);
        assert_eq!(LensType::from_class(5), LensType::Unknown);

        assert_eq!(ShotType::from_objects_percentage(4.9), ShotType::LongShot);
        assert_eq!(ShotType::from_objects_percentage(5.0), ShotType::WideShot);
        assert_eq!(ShotType::from_objects_percentage(15.0), ShotType::MediumShot);
        assert_eq!(ShotType::from_objects_percentage(39.9), ShotType::MediumShot);
        assert_eq!(ShotType::from_objects_percentage(40.0), ShotType::CloseUp);
    }

    #[test]
    fn test_uniform_gray_frame() {
        let metrics = TechnicalFrameAnalyzer::new()
            .analyze_frame(&solid(128, 128, 128))
            .unwrap();

        assert_eq!(metrics.clarity, 0.0);
        assert_eq!(metrics.sharpness, 0.0);
        assert_eq!(metrics.contrast, 0.0);
        assert!((metrics.brightness - 128.0 / 255.0).abs() < 1e-12);
        assert_eq!(metrics.saturation, 0.0);
        assert_eq!(metrics.color_balance_metric, 0.0);
        assert_eq!(metrics.color_temperature, 0.0);
        assert_eq!(metrics.clarity_category, QualityCategory::Bad);
        assert_eq!(metrics.brightness_category, QualityCategory::Good);
        assert_eq!(metrics.color_temperature_category, TemperatureCategory::Neutral);
        assert!(metrics.lens_type.is_none());
        assert!(metrics.shot_type.is_none());
    }

    #[test]
    fn test_pure_red_frame() {
        let metrics = TechnicalFrameAnalyzer::new()
            .analyze_frame(&solid(255, 0, 0))
            .unwrap();

        // round(0.299 * 255) = 76
        assert!((metrics.brightness - 76.0 / 255.0).abs() < 1e-12);
        assert_eq!(metrics.brightness_category, QualityCategory::Average);
        assert_eq!(metrics.saturation, 1.0);
        assert_eq!(metrics.saturation_category, QualityCategory::Bad);
        assert!((metrics.color_balance_metric - 1.0).abs() < 1e-12);
        assert_eq!(metrics.color_distribution, ColorDistribution { r: 1.0, g: 0.0, b: 0.0 });
        assert!(metrics.color_temperature > 0.99);
        assert_eq!(metrics.color_temperature_category, TemperatureCategory::Warm);
    }

    #[test]
    fn test_blue_frame_is_cold() {
        let metrics = TechnicalFrameAnalyzer::new()
            .analyze_frame(&solid(10, 20, 200))
            .unwrap();
        assert_eq!(metrics.color_temperature_category, TemperatureCategory::Cold);
        assert!((metrics.color_distribution.b - 200.0 / 255.0).abs() < 1e-12);
    }

    #[test]
    fn test_checkerboard_is_clear_and_contrasty() {
        let frame: RgbImage = ImageBuffer::from_fn(16, 16, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([0, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let metrics = TechnicalFrameAnalyzer::new().analyze_frame(&frame).unwrap();

        // 每个像素的拉普拉斯响应都是 ±1020
        assert!((metrics.clarity - 1020.0 * 1020.0).abs() < 1e-6);
        assert_eq!(metrics.clarity_category, QualityCategory::Good);
        assert!((metrics.contrast - 127.5).abs() < 1e-9);
        assert_eq!(metrics.contrast_category, QualityCategory::Good);
        // 对角邻居与中心同色，xy 方向 Sobel 响应为 0
        assert_eq!(metrics.sharpness, 0.0);
    }

    #[test]
    fn test_categories_are_pure_functions_of_scalars() {
        let metrics = TechnicalFrameAnalyzer::new()
            .analyze_frame(&solid(90, 140, 60))
            .unwrap();
        assert_eq!(metrics.clarity_category, clarity_category(metrics.clarity));
        assert_eq!(metrics.brightness_category, brightness_category(metrics.brightness));
        assert_eq!(metrics.saturation_category, saturation_category(metrics.saturation));
        assert_eq!(
            metrics.color_temperature_category,
            temperature_category(metrics.color_temperature)
        );
    }

    #[test]
    fn test_empty_frame_yields_none() {
        let frame = RgbImage::new(0, 0);
        assert!(TechnicalFrameAnalyzer::new().analyze_frame(&frame).is_none());
    }

    #[test]
    fn test_sub_models_fill_optional_metrics() {
        let analyzer = TechnicalFrameAnalyzer::new()
            .with_lens_classifier(Box::new(FixedLens(1)))
            .with_object_segmenter(Box::new(FixedMasks(vec![0.05, 0.5, 0.1, 0.9, 0.2, 0.01])));
        let metrics = analyzer.analyze_frame(&solid(100, 100, 100)).unwrap();

        assert_eq!(metrics.lens_type, Some(LensType::Fisheye));
        let percentage = metrics.main_objects_percentage.unwrap();
        assert!((percentage - 175.0).abs() < 1e-9);
        assert_eq!(metrics.shot_type, Some(ShotType::CloseUp));
    }

    #[test]
    fn test_failing_sub_model_omits_metric() {
        let analyzer = TechnicalFrameAnalyzer::new().with_lens_classifier(Box::new(BrokenLens));
        let metrics = analyzer.analyze_frame(&solid(100, 100, 100)).unwrap();
        assert!(metrics.lens_type.is_none());

        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json.get("lens_type").is_none());
        assert!(json.get("shot_type").is_none());
        assert_eq!(json["clarity_category"], "bad");
    }

    #[test]
    fn test_serialized_labels() {
        assert_eq!(serde_json::to_value(LensType::WideAngle).unwrap(), "wide-angle lens");
        assert_eq!(serde_json::to_value(ShotType::CloseUp).unwrap(), "close-up");
        assert_eq!(
            serde_json::to_value(TemperatureCategory::ProbablyWarm).unwrap(),
            "probably_warm"
        );
    }

    #[test]
    fn test_resize_for_segmenter() {
        let frame = RgbImage::new(1920, 1080);
        let resized = resize_for_segmenter(&frame, 416);
        assert_eq!(resized.width(), 416);
        assert_eq!(resized.height(), 224);
    }

    #[test]
    fn test_hog_feature_layout() {
        let features = hog_features(&solid(50, 60, 70));
        // 15x15 个块，每块 2x2 个单元，每单元 9 个方向
        assert_eq!(features.len(), 15 * 15 * 4 * 9);
        assert!(features.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_linear_svm_picks_best_class() {
        let len = LENS_FEATURE_LEN;
        let model = LinearSvmModel {
            classes: vec![0, 1, 2],
            weights: vec![vec![0.0; len]; 3],
            intercepts: vec![0.1, 0.2, 0.5],
        };
        let classifier = LinearSvmLensClassifier::from_model(model).unwrap();
        assert_eq!(classifier.predict(&solid(1, 2, 3)).unwrap(), 2);

        let analyzer = TechnicalFrameAnalyzer::new().with_lens_classifier(Box::new(classifier));
        let metrics = analyzer.analyze_frame(&solid(1, 2, 3)).unwrap();
        assert_eq!(metrics.lens_type, Some(LensType::WideAngle));
    }

    #[test]
    fn test_linear_svm_rejects_bad_models() {
        let bad = LinearSvmModel {
            classes: vec![0, 1],
            weights: vec![vec![0.0; 4]],
            intercepts: vec![0.0, 0.0],
        };
        assert!(LinearSvmLensClassifier::from_model(bad).is_err());

        let short = LinearSvmModel {
            classes: vec![0],
            weights: vec![vec![0.0; 4]],
            intercepts: vec![0.0],
        };
        let classifier = LinearSvmLensClassifier::from_model(short).unwrap();
        assert!(classifier.predict(&solid(1, 2, 3)).is_err());
    }

    #[test]
    fn test_from_config_without_models() {
        let analyzer = TechnicalFrameAnalyzer::from_config(&ModelConfig::default());
        assert!(!analyzer.has_lens_classifier());
        assert!(!analyzer.has_object_segmenter());

        let missing = ModelConfig {
            lens_model_path: Some("/nonexistent/svm.json".into()),
            object_model_endpoint: Some("not a url".to_string()),
            ..Default::default()
        };
        let analyzer = TechnicalFrameAnalyzer::from_config(&missing);
        assert!(!analyzer.has_lens_classifier());
        assert!(!analyzer.has_object_segmenter());
    }

    #[test]
    fn test_from_config_object_model_fills_shot_type() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("segment.sh");
        std::fs::write(&script, "echo '[0.3, 0.05, 0.2]'\n").unwrap();
        let config = ModelConfig {
            object_model_command: Some(format!("sh {}", script.display())),
            ..Default::default()
        };

        let analyzer = TechnicalFrameAnalyzer::from_config(&config);
        assert!(analyzer.has_object_segmenter());
        let metrics = analyzer.analyze_frame(&solid(90, 120, 30)).unwrap();
        let percentage = metrics.main_objects_percentage.unwrap();
        assert!((percentage - 55.0).abs() < 1e-9);
        assert_eq!(metrics.shot_type, Some(ShotType::from_objects_percentage(percentage)));
    }

    struct PanickingLens;

    impl LensClassifier for PanickingLens {
        fn predict(&self, _frame: &RgbImage) -> Result<i64> {
            panic!("index out of bounds in lens model")
        }
    }

    struct PanickingMasks;

    impl ObjectSegmenter for PanickingMasks {
        fn mask_fractions(&self, _frame: &RgbImage) -> Result<Vec<f64>> {
            panic!("segmenter crashed")
        }
    }

    #[test]
    fn test_panicking_sub_models_only_drop_their_metrics() {
        let analyzer = TechnicalFrameAnalyzer::new()
            .with_lens_classifier(Box::new(PanickingLens))
            .with_object_segmenter(Box::new(PanickingMasks));
        let metrics = analyzer.analyze_frame(&solid(200, 100, 50)).unwrap();
        assert!(metrics.lens_type.is_none());
        assert!(metrics.main_objects_percentage.is_none());
        assert!(metrics.shot_type.is_none());
        assert_eq!(metrics.color_temperature_category, temperature_category(metrics.color_temperature));
    }

    #[test]
    fn test_lens_feature_layout() {
        let extractor = LensFeatureExtractor::new();
        let flat = extractor.extract(&solid(50, 60, 70)).unwrap();
        assert_eq!(flat.len(), LENS_FEATURE_LEN);
        assert_eq!(LENS_FEATURE_LEN, HOG_FEATURE_LEN + 128 + 32);
        // 纯色画面没有角点，两段描述子均值都是 0
        assert!(flat[HOG_FEATURE_LEN..].iter().all(|v| *v == 0.0));

        let square: RgbImage = ImageBuffer::from_fn(512, 512, |x, y| {
            if (160..352).contains(&x) && (160..352).contains(&y) {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let features = extractor.extract(&square).unwrap();
        assert_eq!(features.len(), LENS_FEATURE_LEN);
        let gradient = &features[HOG_FEATURE_LEN..HOG_FEATURE_LEN + GRADIENT_DESCRIPTOR_LEN];
        assert!(gradient.iter().any(|v| *v > 0.0));
        assert!(gradient.iter().all(|v| *v <= 255.0));
        let brief_part = &features[HOG_FEATURE_LEN + GRADIENT_DESCRIPTOR_LEN..];
        assert_eq!(brief_part.len(), BRIEF_DESCRIPTOR_LEN);
        assert!(brief_part.iter().all(|v| (0.0..=255.0).contains(v)));
    }

    #[test]
    fn test_brief_test_pairs_stay_in_patch() {
        let pairs = brief_test_pairs();
        assert_eq!(pairs.len(), 256);
        assert!(pairs
            .iter()
            .all(|p| p.p0.x < 31 && p.p0.y < 31 && p.p1.x < 31 && p.p1.y < 31));
        let coords = |pairs: &[TestPair]| -> Vec<(u32, u32, u32, u32)> {
            pairs.iter().map(|p| (p.p0.x, p.p0.y, p.p1.x, p.p1.y)).collect()
        };
        assert_eq!(coords(&pairs), coords(&brief_test_pairs()));
    }
}
