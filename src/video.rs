//! Videos stored as directories of frames.
//!
//! Each video is a directory holding its frames as images sorted by name.
//! Loaded clips are `(frame, 3, size, size)` float tensors in `[-1, 1]`.
use crate::error::{Error, Result};
use crate::train::{VideoBatch, VideoLoader};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tch::{Kind, Tensor};

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// The frame files of a video directory, sorted by name.
pub fn list_frames<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let mut frames = vec![];
    for entry in std::fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        let is_frame = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| FRAME_EXTENSIONS.contains(&ext.to_lowercase().as_str()));
        if is_frame {
            frames.push(path);
        }
    }
    frames.sort();
    Ok(frames)
}

/// Picks a random window of `size` frames, returning `(start, end)` with
/// `end` exclusive and clamped to `total`.
pub fn temporal_random_crop<R: Rng>(total: usize, size: usize, rng: &mut R) -> (usize, usize) {
    let rand_end = total.saturating_sub(size + 1);
    let start = rng.gen_range(0..=rand_end);
    (start, (start + size).min(total))
}

/// `num` evenly spaced indices from `start` to `end - 1`, truncated towards
/// zero.
pub fn frame_indices(start: usize, end: usize, num: usize) -> Vec<usize> {
    let last = end.saturating_sub(1).max(start) as f64;
    let first = start as f64;
    match num {
        0 => vec![],
        1 => vec![start],
        _ => (0..num)
            .map(|i| (first + (last - first) * i as f64 / (num - 1) as f64) as usize)
            .collect(),
    }
}

/// Resizes so that the short side is `size` and keeps the central square.
fn resize_center_crop(frame: &Tensor, size: i64) -> Result<Tensor> {
    let (_num_channels, height, width) = frame.size3()?;
    let scale = size as f64 / height.min(width) as f64;
    let new_height = ((height as f64 * scale).round() as i64).max(size);
    let new_width = ((width as f64 * scale).round() as i64).max(size);
    let frame = tch::vision::image::resize(frame, new_width, new_height)?;
    let top = (new_height - size) / 2;
    let left = (new_width - size) / 2;
    Ok(frame.narrow(1, top, size).narrow(2, left, size))
}

fn load_frames(frames: &[PathBuf], indices: &[usize], size: i64) -> Result<Tensor> {
    let frames = indices
        .iter()
        .map(|&i| {
            let frame = tch::vision::image::load(&frames[i])?;
            resize_center_crop(&frame, size)
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tensor::stack(&frames, 0).to_kind(Kind::Float) / 127.5 - 1.)
}

/// Frames sampled from a video directory: a random window of
/// `num_frames * frame_interval` frames, subsampled to `num_frames`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClipSampling {
    pub num_frames: usize,
    pub frame_interval: usize,
    pub image_size: usize,
}

impl ClipSampling {
    /// The frame indices to load out of `total` frames.
    pub fn indices<R: Rng>(&self, total: usize, rng: &mut R) -> Result<Vec<usize>> {
        let (start, end) = temporal_random_crop(total, self.num_frames * self.frame_interval, rng);
        if end - start < self.num_frames {
            return Err(Error::Config(format!(
                "video has {total} frames, {} are needed",
                self.num_frames
            )));
        }
        Ok(frame_indices(start, end, self.num_frames))
    }

    pub fn load<P: AsRef<Path>, R: Rng>(&self, dir: P, rng: &mut R) -> Result<Tensor> {
        let frames = list_frames(dir)?;
        let indices = self.indices(frames.len(), rng)?;
        load_frames(&frames, &indices, self.image_size as i64)
    }

    /// Loads a video and its mask using the same frame indices.
    pub fn load_pair<R: Rng>(
        &self,
        video: &Path,
        mask: &Path,
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)> {
        let video_frames = list_frames(video)?;
        let mask_frames = list_frames(mask)?;
        let total = video_frames.len().min(mask_frames.len());
        let indices = self.indices(total, rng)?;
        let size = self.image_size as i64;
        let video = load_frames(&video_frames, &indices, size)?;
        let mask = load_frames(&mask_frames, &indices, size)?;
        Ok((video, mask))
    }
}

/// Maps samples in `[-1, 1]` to `uint8` pixels.
pub fn to_uint8(xs: &Tensor) -> Tensor {
    ((xs * 0.5 + 0.5) * 255. + 0.5).clamp(0., 255.).to_kind(Kind::Uint8)
}

/// Writes a `(frame, 3, h, w)` clip in `[-1, 1]` as `frame_000.png`, ... in
/// `dir`, creating it when needed.
pub fn save_frames<P: AsRef<Path>>(video: &Tensor, dir: P) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let video = to_uint8(video).to_device(tch::Device::Cpu);
    let num_frames = video.size()[0];
    let mut paths = Vec::with_capacity(num_frames as usize);
    for index in 0..num_frames {
        let path = dir.join(format!("frame_{index:03}.png"));
        tch::vision::image::save(&video.get(index), &path)?;
        paths.push(path);
    }
    Ok(paths)
}

/// A directory holding one frame directory per video, with optionally a
/// parallel directory of masks using the same names.
#[derive(Debug)]
pub struct FrameFolderDataset {
    videos: Vec<PathBuf>,
    mask_dir: Option<PathBuf>,
    sampling: ClipSampling,
}

impl FrameFolderDataset {
    pub fn new<P: AsRef<Path>>(
        data_path: P,
        mask_dir: Option<PathBuf>,
        sampling: ClipSampling,
    ) -> Result<Self> {
        let mut videos = vec![];
        for entry in std::fs::read_dir(data_path.as_ref())? {
            let path = entry?.path();
            if path.is_dir() {
                videos.push(path);
            }
        }
        videos.sort();
        if videos.is_empty() {
            return Err(Error::Config(format!("no videos in {:?}", data_path.as_ref())));
        }
        Ok(Self { videos, mask_dir, sampling })
    }

    pub fn len(&self) -> usize {
        self.videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    /// Returns the clip and, with a mask directory, its mask.
    pub fn get<R: Rng>(&self, index: usize, rng: &mut R) -> Result<(Tensor, Option<Tensor>)> {
        let video = &self.videos[index];
        match &self.mask_dir {
            Some(mask_dir) => {
                let name = video.file_name().ok_or_else(|| {
                    Error::Config(format!("cannot name the mask of {video:?}"))
                })?;
                let (video, mask) = self.sampling.load_pair(video, &mask_dir.join(name), rng)?;
                Ok((video, Some(mask)))
            }
            None => Ok((self.sampling.load(video, rng)?, None)),
        }
    }
}

/// Iterates over a [`FrameFolderDataset`] in shuffled batches. The shuffle is
/// seeded by the epoch so all workers agree on it, each worker then takes
/// every `world_size`-th video. Incomplete batches are dropped.
#[derive(Debug)]
pub struct FrameFolderLoader {
    dataset: FrameFolderDataset,
    batch_size: usize,
    seed: u64,
    rank: usize,
    world_size: usize,
    order: Vec<usize>,
    rng: StdRng,
}

impl FrameFolderLoader {
    pub fn new(
        dataset: FrameFolderDataset,
        batch_size: usize,
        seed: u64,
        rank: usize,
        world_size: usize,
    ) -> Self {
        let rng = StdRng::seed_from_u64(seed.wrapping_add(rank as u64));
        Self { dataset, batch_size, seed, rank, world_size, order: vec![], rng }
    }
}

impl VideoLoader for FrameFolderLoader {
    fn batches_per_epoch(&self) -> usize {
        self.dataset.len() / self.world_size.max(1) / self.batch_size.max(1)
    }

    fn set_epoch(&mut self, epoch: usize) {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64)));
        self.order = order.into_iter().skip(self.rank).step_by(self.world_size.max(1)).collect();
    }

    fn batch(&mut self, index: usize) -> Result<VideoBatch> {
        let start = index * self.batch_size;
        let indices = self.order.get(start..start + self.batch_size).ok_or_else(|| {
            Error::Config(format!("batch {index} is out of the epoch"))
        })?;
        let mut videos = vec![];
        let mut masks = vec![];
        for &i in indices {
            let (video, mask) = self.dataset.get(i, &mut self.rng)?;
            videos.push(video);
            masks.extend(mask);
        }
        let mask = if masks.len() == videos.len() { Some(Tensor::stack(&masks, 0)) } else { None };
        Ok(VideoBatch { video: Tensor::stack(&videos, 0), mask, labels: None })
    }
}
