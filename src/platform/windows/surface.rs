use anyhow::Context;
use windows::Win32::Graphics::Direct3D11::{
    D3D11_BOX, D3D11_CPU_ACCESS_READ, D3D11_MAP_READ, D3D11_MAPPED_SUBRESOURCE,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_STAGING, ID3D11DeviceContext, ID3D11Texture2D,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_B8G8R8A8_UNORM_SRGB,
    DXGI_FORMAT_R16G16B16A16_FLOAT, DXGI_SAMPLE_DESC,
};

use crate::backend::{MappedSurface, SurfaceSink, SurfaceSize};
use crate::convert::SurfacePixelFormat;
use crate::error::{CaptureError, CaptureResult};
use crate::region::Region;

use super::d3d11::D3dDevice;

pub(crate) fn surface_format(format: DXGI_FORMAT) -> Option<SurfacePixelFormat> {
    match format {
        DXGI_FORMAT_B8G8R8A8_UNORM | DXGI_FORMAT_B8G8R8A8_UNORM_SRGB => {
            Some(SurfacePixelFormat::Bgra8)
        }
        DXGI_FORMAT_R16G16B16A16_FLOAT => Some(SurfacePixelFormat::Rgba16Float),
        _ => None,
    }
}

pub(crate) fn texture_desc(texture: &ID3D11Texture2D) -> D3D11_TEXTURE2D_DESC {
    let mut desc = D3D11_TEXTURE2D_DESC::default();
    unsafe { texture.GetDesc(&mut desc) };
    desc
}

/// CPU-readable copy target, rebuilt only when the requested size or
/// format changes.
#[derive(Default)]
pub(crate) struct StagingCache {
    texture: Option<ID3D11Texture2D>,
    size: SurfaceSize,
    format: DXGI_FORMAT,
}

impl StagingCache {
    fn ensure(
        &mut self,
        device: &D3dDevice,
        size: SurfaceSize,
        format: DXGI_FORMAT,
    ) -> CaptureResult<ID3D11Texture2D> {
        if let Some(texture) = &self.texture {
            if self.size == size && self.format == format {
                return Ok(texture.clone());
            }
        }

        let desc = D3D11_TEXTURE2D_DESC {
            Width: size.width,
            Height: size.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_STAGING,
            BindFlags: Default::default(),
            CPUAccessFlags: D3D11_CPU_ACCESS_READ.0 as u32,
            MiscFlags: Default::default(),
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { device.device().CreateTexture2D(&desc, None, Some(&mut texture)) }
            .map_err(|error| device.classify(error, "CreateTexture2D for staging failed"))?;
        let texture = texture
            .context("CreateTexture2D returned no staging texture")
            .map_err(CaptureError::Platform)?;

        tracing::debug!(
            width = size.width,
            height = size.height,
            format = format.0,
            "staging texture (re)created"
        );
        self.texture = Some(texture.clone());
        self.size = size;
        self.format = format;
        Ok(texture)
    }

    /// Copies `region` of `source` into the staging texture, maps it and
    /// hands the bytes to `sink` labelled as `reported`. The caller holds
    /// the context lock.
    pub(crate) fn read(
        &mut self,
        device: &D3dDevice,
        context: &ID3D11DeviceContext,
        source: &ID3D11Texture2D,
        region: Region,
        reported: SurfacePixelFormat,
        sink: &mut SurfaceSink<'_>,
    ) -> CaptureResult<()> {
        let source_desc = texture_desc(source);
        let source_size = SurfaceSize::new(source_desc.Width, source_desc.Height);
        if region.is_empty() || !region.fits(source_size) {
            return Err(CaptureError::InvalidConfig(format!(
                "region {region:?} does not fit a {}x{} surface",
                source_size.width, source_size.height
            )));
        }

        let size = region.size();
        let staging = self.ensure(device, size, source_desc.Format)?;
        let copy_box = D3D11_BOX {
            left: region.left,
            top: region.top,
            front: 0,
            right: region.right,
            bottom: region.bottom,
            back: 1,
        };

        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe {
            context.CopySubresourceRegion(&staging, 0, 0, 0, 0, source, 0, Some(&copy_box));
            context.Map(&staging, 0, D3D11_MAP_READ, 0, Some(&mut mapped))
        }
        .map_err(|error| device.classify(error, "Map staging texture failed"))?;

        let row_pitch = mapped.RowPitch as usize;
        let result = (|| {
            let row_bytes = (size.width as usize)
                .checked_mul(reported.bytes_per_pixel())
                .ok_or(CaptureError::BufferOverflow)?;
            let len = row_pitch
                .checked_mul(size.height as usize - 1)
                .and_then(|base| base.checked_add(row_bytes))
                .ok_or(CaptureError::BufferOverflow)?;
            if mapped.pData.is_null() || row_pitch < row_bytes {
                return Err(CaptureError::Platform(anyhow::anyhow!(
                    "mapped staging texture is unusable (pitch {row_pitch}, row {row_bytes})"
                )));
            }
            // SAFETY: Map succeeded, so pData addresses at least
            // RowPitch * (height - 1) + row_bytes readable bytes until Unmap.
            let data = unsafe { std::slice::from_raw_parts(mapped.pData as *const u8, len) };
            sink(MappedSurface {
                data,
                row_pitch,
                size,
                format: reported,
            })
        })();

        unsafe { context.Unmap(&staging, 0) };
        result
    }

    pub(crate) fn clear(&mut self) {
        self.texture = None;
        self.size = SurfaceSize::default();
        self.format = DXGI_FORMAT::default();
    }
}
