use std::sync::OnceLock;

use anyhow::Context;
use windows::Win32::Graphics::Direct3D11::{
    D3D11_BIND_CONSTANT_BUFFER, D3D11_BIND_UNORDERED_ACCESS, D3D11_BUFFER_DESC,
    D3D11_CPU_ACCESS_WRITE, D3D11_MAP_WRITE_DISCARD, D3D11_MAPPED_SUBRESOURCE,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT, D3D11_USAGE_DYNAMIC, ID3D11Buffer,
    ID3D11ComputeShader, ID3D11DeviceContext, ID3D11ShaderResourceView, ID3D11Texture2D,
    ID3D11UnorderedAccessView,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT_R8G8B8A8_UNORM, DXGI_FORMAT_R16G16B16A16_FLOAT, DXGI_SAMPLE_DESC,
};
use windows::core::Interface;

use crate::backend::{GpuDevice, SurfaceSink, SurfaceSize};
use crate::convert::SurfacePixelFormat;
use crate::error::{CaptureError, CaptureResult};
use crate::region::Region;

use super::d3d11::D3dDevice;
use super::surface::{StagingCache, texture_desc};

/// Edge length of the shader's square thread group.
const THREAD_GROUP_EDGE: u32 = 8;

#[cfg(has_precompiled_tonemap)]
const PRECOMPILED_CSO: &[u8] = include_bytes!(env!("TONEMAP_CSO_PATH"));

/// Shader bytecode, compiled at most once per process. Build-time fxc
/// output is used when available.
fn cached_bytecode() -> &'static Result<Vec<u8>, String> {
    static BYTECODE: OnceLock<Result<Vec<u8>, String>> = OnceLock::new();
    BYTECODE.get_or_init(|| {
        #[cfg(has_precompiled_tonemap)]
        {
            Ok(PRECOMPILED_CSO.to_vec())
        }
        #[cfg(not(has_precompiled_tonemap))]
        {
            compile_shader_runtime()
        }
    })
}

#[cfg(not(has_precompiled_tonemap))]
fn compile_shader_runtime() -> Result<Vec<u8>, String> {
    use windows::Win32::Graphics::Direct3D::Fxc::D3DCompile;
    use windows::core::s;

    let source = include_str!("tonemap_cs.hlsl").as_bytes();
    let mut blob = None;
    let mut errors = None;

    let hr = unsafe {
        D3DCompile(
            source.as_ptr() as *const _,
            source.len(),
            s!("tonemap_cs.hlsl"),
            None,
            None,
            s!("main"),
            s!("cs_5_0"),
            0,
            0,
            &mut blob,
            Some(&mut errors),
        )
    };

    if let Err(e) = hr {
        let log = errors
            .map(|b| {
                let ptr = unsafe { b.GetBufferPointer() } as *const u8;
                let len = unsafe { b.GetBufferSize() };
                String::from_utf8_lossy(unsafe { std::slice::from_raw_parts(ptr, len) })
                    .trim()
                    .to_string()
            })
            .unwrap_or_default();
        return Err(format!("{e}: {log}"));
    }

    let blob = blob.ok_or_else(|| "D3DCompile returned no bytecode".to_string())?;
    let ptr = unsafe { blob.GetBufferPointer() } as *const u8;
    let len = unsafe { blob.GetBufferSize() };
    Ok(unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec())
}

/// Constant buffer layout; matches `cbuffer Params` in the shader.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
struct ShaderParams {
    origin_x: u32,
    origin_y: u32,
    extent_x: u32,
    extent_y: u32,
}

struct OutputTarget {
    texture: ID3D11Texture2D,
    uav: ID3D11UnorderedAccessView,
    size: SurfaceSize,
}

/// Runs `tonemap_cs.hlsl` over a region of an RGBA16F texture and reads
/// the BGRA8 result back through its own staging texture.
pub(crate) struct GpuToneMapper {
    shader: ID3D11ComputeShader,
    params: ID3D11Buffer,
    last_params: Option<ShaderParams>,
    output: Option<OutputTarget>,
    source_view: Option<(usize, ID3D11ShaderResourceView)>,
    staging: StagingCache,
}

// SAFETY: only reached from the capture item's resource mutex.
unsafe impl Send for GpuToneMapper {}

impl GpuToneMapper {
    pub(crate) fn new(device: &D3dDevice) -> CaptureResult<Self> {
        let bytecode = cached_bytecode()
            .as_ref()
            .map_err(|message| CaptureError::ShaderCompilation(message.clone()))?;

        let mut shader: Option<ID3D11ComputeShader> = None;
        unsafe {
            device
                .device()
                .CreateComputeShader(bytecode, None, Some(&mut shader))
        }
        .map_err(|error| CaptureError::ShaderCompilation(format!("CreateComputeShader: {error}")))?;
        let shader = shader.ok_or_else(|| {
            CaptureError::ShaderCompilation("CreateComputeShader returned no shader".into())
        })?;

        let desc = D3D11_BUFFER_DESC {
            ByteWidth: std::mem::size_of::<ShaderParams>().next_multiple_of(16) as u32,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            ..Default::default()
        };
        let mut params: Option<ID3D11Buffer> = None;
        unsafe { device.device().CreateBuffer(&desc, None, Some(&mut params)) }
            .map_err(|error| device.classify(error, "CreateBuffer for shader params failed"))?;
        let params = params
            .context("CreateBuffer returned no constant buffer")
            .map_err(CaptureError::Platform)?;

        tracing::info!(adapter = %device.description(), "GPU tone-mapper ready");
        Ok(Self {
            shader,
            params,
            last_params: None,
            output: None,
            source_view: None,
            staging: StagingCache::default(),
        })
    }

    fn ensure_output(&mut self, device: &D3dDevice, size: SurfaceSize) -> CaptureResult<()> {
        if self.output.as_ref().is_some_and(|output| output.size == size) {
            return Ok(());
        }

        let desc = D3D11_TEXTURE2D_DESC {
            Width: size.width,
            Height: size.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_R8G8B8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_UNORDERED_ACCESS.0 as u32,
            ..Default::default()
        };
        let mut texture: Option<ID3D11Texture2D> = None;
        unsafe { device.device().CreateTexture2D(&desc, None, Some(&mut texture)) }
            .map_err(|error| device.classify(error, "CreateTexture2D for tone-map output failed"))?;
        let texture = texture
            .context("CreateTexture2D returned no output texture")
            .map_err(CaptureError::Platform)?;

        let mut uav: Option<ID3D11UnorderedAccessView> = None;
        unsafe {
            device
                .device()
                .CreateUnorderedAccessView(&texture, None, Some(&mut uav))
        }
        .map_err(|error| device.classify(error, "CreateUnorderedAccessView failed"))?;
        let uav = uav
            .context("CreateUnorderedAccessView returned no view")
            .map_err(CaptureError::Platform)?;

        self.output = Some(OutputTarget { texture, uav, size });
        Ok(())
    }

    /// The frame pool recycles a handful of textures, so the view of the
    /// last one seen is usually still valid.
    fn source_view(
        &mut self,
        device: &D3dDevice,
        source: &ID3D11Texture2D,
    ) -> CaptureResult<ID3D11ShaderResourceView> {
        let key = source.as_raw() as usize;
        if let Some((cached_key, view)) = &self.source_view {
            if *cached_key == key {
                return Ok(view.clone());
            }
        }

        let mut view: Option<ID3D11ShaderResourceView> = None;
        unsafe {
            device
                .device()
                .CreateShaderResourceView(source, None, Some(&mut view))
        }
        .map_err(|error| device.classify(error, "CreateShaderResourceView failed"))?;
        let view = view
            .context("CreateShaderResourceView returned no view")
            .map_err(CaptureError::Platform)?;
        self.source_view = Some((key, view.clone()));
        Ok(view)
    }

    fn upload_params(
        &mut self,
        device: &D3dDevice,
        context: &ID3D11DeviceContext,
        params: ShaderParams,
    ) -> CaptureResult<()> {
        if self.last_params == Some(params) {
            return Ok(());
        }
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        unsafe { context.Map(&self.params, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped)) }
            .map_err(|error| device.classify(error, "Map shader params failed"))?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                &params as *const ShaderParams as *const u8,
                mapped.pData as *mut u8,
                std::mem::size_of::<ShaderParams>(),
            );
            context.Unmap(&self.params, 0);
        }
        self.last_params = Some(params);
        Ok(())
    }

    /// Tone maps `region` of `source` and passes the BGRA8 bytes to `sink`.
    pub(crate) fn tonemap(
        &mut self,
        device: &D3dDevice,
        source: &ID3D11Texture2D,
        region: Region,
        sink: &mut SurfaceSink<'_>,
    ) -> CaptureResult<()> {
        let desc = texture_desc(source);
        if desc.Format != DXGI_FORMAT_R16G16B16A16_FLOAT {
            return Err(CaptureError::UnsupportedFormat(format!(
                "GPU tone mapping expects R16G16B16A16_FLOAT, got {:?}",
                desc.Format
            )));
        }
        let size = region.size();
        if size.is_empty() || !region.fits(SurfaceSize::new(desc.Width, desc.Height)) {
            return Err(CaptureError::InvalidConfig(format!(
                "region {region:?} does not fit a {}x{} surface",
                desc.Width, desc.Height
            )));
        }

        self.ensure_output(device, size)?;
        let view = self.source_view(device, source)?;
        let context = device.context()?;
        self.upload_params(
            device,
            &context,
            ShaderParams {
                origin_x: region.left,
                origin_y: region.top,
                extent_x: size.width,
                extent_y: size.height,
            },
        )?;

        let Some(output) = self.output.as_ref() else {
            return Err(CaptureError::Platform(anyhow::anyhow!(
                "tone-map output texture missing"
            )));
        };

        unsafe {
            context.CSSetShader(&self.shader, None);
            context.CSSetConstantBuffers(0, Some(&[Some(self.params.clone())]));
            context.CSSetShaderResources(0, Some(&[Some(view)]));
            context.CSSetUnorderedAccessViews(
                0,
                1,
                Some(&Some(output.uav.clone()) as *const _),
                None,
            );
            context.Dispatch(
                size.width.div_ceil(THREAD_GROUP_EDGE),
                size.height.div_ceil(THREAD_GROUP_EDGE),
                1,
            );
            let no_view: Option<ID3D11ShaderResourceView> = None;
            context.CSSetShaderResources(0, Some(&[no_view]));
            context.CSSetUnorderedAccessViews(0, 1, Some(&None as *const _), None);
        }

        let texture = output.texture.clone();
        self.staging.read(
            device,
            &context,
            &texture,
            Region::full(size),
            SurfacePixelFormat::Bgra8,
            sink,
        )
    }
}
