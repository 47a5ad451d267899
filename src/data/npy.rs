//! NumPy Array Files
//!
//! Reader/writer for the `.npy` storage format the trajectory partitions
//! use: version 1/2 headers, little-endian `<f4`/`<f8` payloads, C order.
//! Data is widened to f64 on read and written back as `<f8`.

use anyhow::{bail, Context, Result};
use ndarray::ArrayD;
use std::fs;
use std::path::Path;

const MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Read an `.npy` file into a dynamic-dimension f64 array.
pub fn read_npy(path: impl AsRef<Path>) -> Result<ArrayD<f64>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() < 10 || &bytes[0..6] != MAGIC {
        bail!("{} is not an npy file", path.display());
    }
    let (major, _minor) = (bytes[6], bytes[7]);
    let (header_len, header_start) = match major {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 => (
            u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
            12,
        ),
        v => bail!("unsupported npy version {} in {}", v, path.display()),
    };
    let header = std::str::from_utf8(&bytes[header_start..header_start + header_len])
        .context("npy header is not valid UTF-8")?;
    let (descr, fortran, shape) = parse_header(header)?;
    if fortran {
        bail!("{}: fortran-order arrays are not supported", path.display());
    }

    let data = &bytes[header_start + header_len..];
    let count: usize = shape.iter().product();
    let values: Vec<f64> = match descr.as_str() {
        "<f8" => {
            if data.len() < count * 8 {
                bail!("{}: truncated payload", path.display());
            }
            data.chunks_exact(8)
                .take(count)
                .map(|c| f64::from_le_bytes(c.try_into().expect("8-byte chunk")))
                .collect()
        }
        "<f4" => {
            if data.len() < count * 4 {
                bail!("{}: truncated payload", path.display());
            }
            data.chunks_exact(4)
                .take(count)
                .map(|c| f32::from_le_bytes(c.try_into().expect("4-byte chunk")) as f64)
                .collect()
        }
        other => bail!("{}: unsupported dtype {}", path.display(), other),
    };

    ArrayD::from_shape_vec(shape, values).context("npy shape/payload mismatch")
}

/// Write an f64 array as a version-1 `.npy` file.
pub fn write_npy(path: impl AsRef<Path>, array: &ArrayD<f64>) -> Result<()> {
    let path = path.as_ref();
    let shape: Vec<String> = array.shape().iter().map(|d| d.to_string()).collect();
    let shape_str = match shape.len() {
        0 => "()".to_string(),
        1 => format!("({},)", shape[0]),
        _ => format!("({})", shape.join(", ")),
    };
    let mut header = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': {}, }}",
        shape_str
    );
    // Pad so the payload starts on a 64-byte boundary.
    let unpadded = MAGIC.len() + 4 + header.len() + 1;
    let pad = (64 - unpadded % 64) % 64;
    header.extend(std::iter::repeat(' ').take(pad));
    header.push('\n');

    let mut out = Vec::with_capacity(unpadded + pad + array.len() * 8);
    out.extend_from_slice(MAGIC);
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for v in array.iter() {
        out.extend_from_slice(&v.to_le_bytes());
    }
    fs::write(path, out).with_context(|| format!("writing {}", path.display()))
}

fn parse_header(header: &str) -> Result<(String, bool, Vec<usize>)> {
    let descr = extract_quoted(header, "'descr':")
        .context("npy header missing 'descr'")?;
    let fortran = header
        .split("'fortran_order':")
        .nth(1)
        .map(|rest| rest.trim_start().starts_with("True"))
        .context("npy header missing 'fortran_order'")?;

    let shape_part = header
        .split("'shape':")
        .nth(1)
        .context("npy header missing 'shape'")?;
    let open = shape_part.find('(').context("malformed shape")?;
    let close = shape_part.find(')').context("malformed shape")?;
    let dims: Vec<usize> = shape_part[open + 1..close]
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().context("malformed shape dimension"))
        .collect::<Result<_>>()?;
    Ok((descr, fortran, dims))
}

fn extract_quoted(header: &str, key: &str) -> Option<String> {
    let rest = header.split(key).nth(1)?;
    let start = rest.find('\'')? + 1;
    let end = start + rest[start..].find('\'')?;
    Some(rest[start..end].to_string())
}
