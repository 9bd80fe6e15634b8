//! Minimal NIfTI-1 reader
//!
//! Only what the conversion needs: the 348-byte header (shape, voxel type,
//! byte order, data offset) and one `(x, y, z)` volume at a time, returned
//! as `[1, rows, columns, planes]` so frames can be appended to a
//! `[t, rows, columns, planes]` series.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use ndarray::{Array3, Array4, Axis};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{ConversionError, Result};

const HEADER_SIZE: usize = 348;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxelType {
    UInt8,
    Int8,
    Int16,
    UInt16,
    Int32,
    Float32,
    Float64,
}

impl VoxelType {
    fn from_code(code: i16) -> Option<Self> {
        match code {
            2 => Some(VoxelType::UInt8),
            4 => Some(VoxelType::Int16),
            8 => Some(VoxelType::Int32),
            16 => Some(VoxelType::Float32),
            64 => Some(VoxelType::Float64),
            256 => Some(VoxelType::Int8),
            512 => Some(VoxelType::UInt16),
            _ => None,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            VoxelType::UInt8 | VoxelType::Int8 => 1,
            VoxelType::Int16 | VoxelType::UInt16 => 2,
            VoxelType::Int32 | VoxelType::Float32 => 4,
            VoxelType::Float64 => 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NiftiHeader {
    /// `(x, y, z, t)`; missing trailing dimensions are 1
    pub dims: [usize; 4],
    /// Voxel spacing along `(x, y, z)` and the frame interval, in file units
    pub pixdim: [f32; 4],
    pub voxel_type: VoxelType,
    pub vox_offset: u64,
    pub endian: Endian,
    pub xyzt_units: u8,
}

impl NiftiHeader {
    pub fn read(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut buf)?;

        if LittleEndian::read_i32(&buf[0..4]) == HEADER_SIZE as i32 {
            parse_header::<LittleEndian>(&buf, Endian::Little, path)
        } else if BigEndian::read_i32(&buf[0..4]) == HEADER_SIZE as i32 {
            parse_header::<BigEndian>(&buf, Endian::Big, path)
        } else {
            Err(nifti_error(path, "sizeof_hdr is not 348 in either byte order"))
        }
    }

    pub fn num_frames(&self) -> usize {
        self.dims[3]
    }

    /// `(rows, columns, planes)` of one frame, i.e. `(y, x, z)`
    pub fn frame_shape(&self) -> (usize, usize, usize) {
        (self.dims[1], self.dims[0], self.dims[2])
    }

    pub fn voxels_per_frame(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.voxels_per_frame() * self.voxel_type.size()
    }
}

fn nifti_error(path: &Path, message: impl Into<String>) -> ConversionError {
    ConversionError::Nifti {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn parse_header<B: ByteOrder>(
    buf: &[u8; HEADER_SIZE],
    endian: Endian,
    path: &Path,
) -> Result<NiftiHeader> {
    if &buf[344..348] != b"n+1\0" {
        return Err(nifti_error(path, "only single-file NIfTI-1 (n+1) volumes are supported"));
    }

    let ndim = B::read_i16(&buf[40..42]);
    if !(1..=7).contains(&ndim) {
        return Err(nifti_error(path, format!("invalid dimension count {ndim}")));
    }
    if ndim > 4 {
        return Err(nifti_error(path, format!("{ndim}-dimensional volumes are not supported")));
    }

    let mut dims = [1usize; 4];
    for (i, dim) in dims.iter_mut().enumerate().take(ndim as usize) {
        let value = B::read_i16(&buf[42 + 2 * i..44 + 2 * i]);
        if value <= 0 {
            return Err(nifti_error(path, format!("dimension {} has size {value}", i + 1)));
        }
        *dim = value as usize;
    }

    let datatype = B::read_i16(&buf[70..72]);
    let voxel_type = VoxelType::from_code(datatype)
        .ok_or_else(|| nifti_error(path, format!("unsupported datatype code {datatype}")))?;

    let mut pixdim = [0f32; 4];
    for (i, value) in pixdim.iter_mut().enumerate() {
        *value = B::read_f32(&buf[80 + 4 * i..84 + 4 * i]);
    }

    let vox_offset = B::read_f32(&buf[108..112]);
    if vox_offset < HEADER_SIZE as f32 {
        return Err(nifti_error(path, format!("vox_offset {vox_offset} points into the header")));
    }

    Ok(NiftiHeader {
        dims,
        pixdim,
        voxel_type,
        vox_offset: vox_offset as u64,
        endian,
        xyzt_units: buf[123],
    })
}

/// One frame as `[1, rows, columns, planes]`
#[derive(Debug, Clone)]
pub enum FrameData {
    UInt8(Array4<u8>),
    Int8(Array4<i8>),
    Int16(Array4<i16>),
    UInt16(Array4<u16>),
    Int32(Array4<i32>),
    Float32(Array4<f32>),
    Float64(Array4<f64>),
}

impl FrameData {
    pub fn shape(&self) -> &[usize] {
        match self {
            FrameData::UInt8(a) => a.shape(),
            FrameData::Int8(a) => a.shape(),
            FrameData::Int16(a) => a.shape(),
            FrameData::UInt16(a) => a.shape(),
            FrameData::Int32(a) => a.shape(),
            FrameData::Float32(a) => a.shape(),
            FrameData::Float64(a) => a.shape(),
        }
    }
}

/// Frame-by-frame access to the voxel data of a `.nii` file
pub struct NiftiVolume {
    path: PathBuf,
    header: NiftiHeader,
    reader: BufReader<File>,
    buffer: Vec<u8>,
}

impl NiftiVolume {
    pub fn open(path: &Path) -> Result<Self> {
        let header = NiftiHeader::read(path)?;
        let file = File::open(path)?;

        let expected = header.vox_offset + (header.bytes_per_frame() * header.num_frames()) as u64;
        let actual = file.metadata()?.len();
        if actual < expected {
            return Err(nifti_error(
                path,
                format!("file holds {actual} bytes, header describes {expected}"),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            header,
            reader: BufReader::with_capacity(1 << 20, file),
            buffer: Vec::new(),
        })
    }

    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read frame `index` and reorder it from `(x, y, z)` file order to
    /// `[1, rows, columns, planes]`
    pub fn read_frame(&mut self, index: usize) -> Result<FrameData> {
        if index >= self.header.num_frames() {
            return Err(nifti_error(
                &self.path,
                format!("frame {index} out of range ({} frames)", self.header.num_frames()),
            ));
        }

        let frame_bytes = self.header.bytes_per_frame();
        let offset = self.header.vox_offset + (index * frame_bytes) as u64;
        self.reader.seek(SeekFrom::Start(offset))?;
        self.buffer.resize(frame_bytes, 0);
        self.reader.read_exact(&mut self.buffer)?;

        let voxels = self.header.voxels_per_frame();
        let [nx, ny, nz, _] = self.header.dims;
        let bytes = &self.buffer;

        macro_rules! decode {
            ($type:ty, $read_into:ident, $variant:ident) => {{
                let mut values = vec![<$type>::default(); voxels];
                match self.header.endian {
                    Endian::Little => LittleEndian::$read_into(bytes, &mut values),
                    Endian::Big => BigEndian::$read_into(bytes, &mut values),
                }
                FrameData::$variant(to_frame_array(values, (nz, ny, nx))?)
            }};
        }

        let frame = match self.header.voxel_type {
            VoxelType::UInt8 => FrameData::UInt8(to_frame_array(bytes.clone(), (nz, ny, nx))?),
            VoxelType::Int8 => FrameData::Int8(to_frame_array(
                bytes.iter().map(|&b| b as i8).collect(),
                (nz, ny, nx),
            )?),
            VoxelType::Int16 => decode!(i16, read_i16_into, Int16),
            VoxelType::UInt16 => decode!(u16, read_u16_into, UInt16),
            VoxelType::Int32 => decode!(i32, read_i32_into, Int32),
            VoxelType::Float32 => decode!(f32, read_f32_into, Float32),
            VoxelType::Float64 => decode!(f64, read_f64_into, Float64),
        };

        Ok(frame)
    }
}

// Voxels are stored x-fastest, so the raw buffer is a C-order (z, y, x) array.
fn to_frame_array<T: Clone>(values: Vec<T>, zyx: (usize, usize, usize)) -> Result<Array4<T>> {
    let volume = Array3::from_shape_vec(zyx, values)?;
    let rows_columns_planes = volume.permuted_axes([1, 2, 0]);
    Ok(rows_columns_planes
        .as_standard_layout()
        .into_owned()
        .insert_axis(Axis(0)))
}
